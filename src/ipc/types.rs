use std::path::PathBuf;

use serde::Deserialize;

use crate::config::Config;
use crate::entities::EntitySpec;
use crate::remote::{self, RemoteResource};
use crate::repo::{Repository, ViewRegistry, ViewTicket};
use crate::store::{KeyValueStore, MemoryStore, SqliteStore};

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<SqliteStore>,
    /// Cache used until a workspace is selected.
    pub memory: MemoryStore,
    pub config: Config,
    pub remote: Box<dyn RemoteResource>,
    pub views: ViewRegistry,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let remote = remote::from_config(&config);
        Self {
            workspace: None,
            db: None,
            memory: MemoryStore::new(),
            config,
            remote,
            views: ViewRegistry::default(),
        }
    }

    pub fn store(&self) -> &dyn KeyValueStore {
        match self.db.as_ref() {
            Some(db) => db,
            None => &self.memory,
        }
    }

    pub fn apply_config(&mut self, config: Config) {
        self.remote = remote::from_config(&config);
        self.config = config;
    }

    /// `params.view` names the view a request belongs to. A named view that
    /// is not open yields a ticket that is already stale.
    pub fn ticket(&self, params: &serde_json::Value) -> Option<ViewTicket> {
        let view = params.get("view").and_then(|v| v.as_str())?;
        Some(self.views.ticket(view).unwrap_or_else(ViewTicket::closed))
    }

    pub fn repo(&self, spec: &'static EntitySpec, params: &serde_json::Value) -> Repository<'_> {
        Repository::new(spec, self.remote.as_ref(), self.store()).with_ticket(self.ticket(params))
    }
}
