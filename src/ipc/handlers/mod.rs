pub mod attendance;
pub mod core;
pub mod exams;
pub mod fees;
pub mod library;
pub mod notices;
pub mod records;
pub mod sync;
