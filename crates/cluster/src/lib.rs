pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod messages;
pub mod state;
pub mod transport;

pub use cancel::{Bounded, Cancellation};
pub use config::ClusterConfig;
pub use coordinator::{reconstruct_strict, MainCoordinator, SubWorker};
pub use dispatcher::{Dispatcher, ExecutionPlan, RunOutcome};
pub use error::{ClusterError, FailureContext};
pub use message::Message;
pub use messages::topics;
pub use state::{MainState, NodeState, StateMachine, SubState};
pub use transport::{connect_with_retry, Connection, FrameError};
