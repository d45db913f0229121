pub mod campaign;
pub mod run;
pub mod serve;

// Re-export command functions for convenience
pub use campaign::{add_campaign, list_campaigns, set_refresh_token, show_campaign};
pub use run::{finalize, tick};
pub use serve::serve;
