pub mod chat;
pub mod doctors;
pub mod references;
pub mod status;

pub use chat::ChatCommand;
pub use doctors::DoctorsCommand;
pub use references::ReferencesCommand;
pub use status::{HealthCommand, ReloadCommand};
