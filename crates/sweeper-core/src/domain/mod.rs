//! Domain model (object ids, deliveries, retry policy, worker state, errors).

pub mod delivery;
pub mod errors;
pub mod object_id;
pub mod policy;
pub mod state;

pub use self::delivery::{Acknowledger, Delivery};
pub use self::errors::{BrokerError, ClientError, DeleteError, PayloadError};
pub use self::object_id::ObjectId;
pub use self::policy::RetryPolicy;
pub use self::state::WorkerState;
