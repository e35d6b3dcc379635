use reqwest::blocking::{multipart, Client};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::error::FacadeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(m: Method) -> Self {
        match m {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    /// Record fields sent as text parts plus one file part.
    Multipart {
        fields: Value,
        file_field: String,
        file_path: PathBuf,
    },
}

/// Opaque REST collaborator. Any failure, whatever its cause, is a
/// `FacadeError::Transport`.
pub trait RemoteResource {
    fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Body>,
    ) -> Result<Value, FacadeError>;

    /// Base URL, or `None` when no endpoint is configured.
    fn endpoint(&self) -> Option<String>;
}

pub struct HttpRemote {
    base: String,
    token: Option<String>,
    client: Client,
}

impl HttpRemote {
    pub fn new(
        base: impl Into<String>,
        timeout: Duration,
        token: Option<String>,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(HttpRemote {
            base: base.into().trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }
}

impl RemoteResource for HttpRemote {
    fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Body>,
    ) -> Result<Value, FacadeError> {
        let url = self.url(path);
        let mut req = self.client.request(method.into(), &url);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        match body {
            Some(Body::Json(v)) => req = req.json(v),
            Some(Body::Multipart {
                fields,
                file_field,
                file_path,
            }) => req = req.multipart(multipart_form(fields, file_field, file_path)?),
            None => {}
        }

        let resp = req
            .send()
            .map_err(|e| FacadeError::transport(format!("{} {} failed: {}", method.as_str(), url, e)))?;
        let status = resp.status();
        if !status.is_success() {
            let t = resp.text().unwrap_or_default();
            return Err(FacadeError::transport(format!(
                "{} {} -> {} {}",
                method.as_str(),
                url,
                status,
                t.chars().take(200).collect::<String>()
            )));
        }
        let text = resp
            .text()
            .map_err(|e| FacadeError::transport(format!("reading body of {} failed: {}", url, e)))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| FacadeError::transport(format!("non-json response from {}: {}", url, e)))
    }

    fn endpoint(&self) -> Option<String> {
        Some(self.base.clone())
    }
}

fn multipart_form(
    fields: &Value,
    file_field: &str,
    file_path: &PathBuf,
) -> Result<multipart::Form, FacadeError> {
    let mut form = multipart::Form::new();
    if let Some(obj) = fields.as_object() {
        for (k, v) in obj {
            if k == file_field {
                continue;
            }
            let text = match v {
                Value::Null => continue,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            form = form.text(k.clone(), text);
        }
    }
    form.file(file_field.to_string(), file_path).map_err(|e| {
        FacadeError::transport(format!(
            "attachment {} unreadable: {}",
            file_path.to_string_lossy(),
            e
        ))
    })
}

/// Used when no endpoint is configured; every call falls back.
pub struct OfflineRemote;

impl RemoteResource for OfflineRemote {
    fn request(
        &self,
        method: Method,
        path: &str,
        _query: &[(String, String)],
        _body: Option<&Body>,
    ) -> Result<Value, FacadeError> {
        Err(FacadeError::transport(format!(
            "no remote endpoint configured for {} {}",
            method.as_str(),
            path
        )))
    }

    fn endpoint(&self) -> Option<String> {
        None
    }
}

pub fn from_config(cfg: &Config) -> Box<dyn RemoteResource> {
    let Some(base) = cfg.base_url.as_deref() else {
        return Box::new(OfflineRemote);
    };
    match HttpRemote::new(base, cfg.timeout(), cfg.auth_token.clone()) {
        Ok(remote) => Box::new(remote),
        Err(e) => {
            tracing::warn!(base, error = %e, "http client setup failed; running offline");
            Box::new(OfflineRemote)
        }
    }
}
