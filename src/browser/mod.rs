pub mod probe;
pub mod scripted;
pub mod session;

pub use probe::{PageProbe, PageReload, PageSignals, Presence, Signature};
pub use session::{BrowserSession, LaunchOptions};
