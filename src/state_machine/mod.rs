mod run;
mod session;
mod state;

pub use run::{RunOutcome, RunRecord};
pub use session::{EngraveSession, SessionEvent};
pub use state::SessionState;
