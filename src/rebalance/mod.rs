pub mod driver;
pub mod outcome;
pub mod progress;
pub mod session;
pub mod subscription;

pub use driver::SessionHandle;
pub use outcome::RebalanceOutcome;
pub use progress::{ProgressEvent, ProgressKind};
pub use session::{RebalanceSession, SessionError, SessionSnapshot, SessionState};
