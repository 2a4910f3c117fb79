//! Task trait: binds a task name to an argument type.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A typed task whose fields are its arguments.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Compute {
///     random_number: i64,
///     now_timestamp: String,
/// }
///
/// impl Task for Compute {
///     const NAME: &'static str = "compute";
///     const QUEUE: Option<&'static str> = Some("compute");
/// }
/// ```
///
/// Tasks without arguments use an empty braced struct (`struct Ping {}`) so
/// they bind from both `{}` and `[]`.
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;

    /// Queue declared by the task itself; the route table still wins.
    const QUEUE: Option<&'static str> = None;
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde::{Deserialize, Serialize};

    use super::Task;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Double {
        pub value: i64,
    }

    impl Task for Double {
        const NAME: &'static str = "double";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Ping {}

    impl Task for Ping {
        const NAME: &'static str = "ping";
        const QUEUE: Option<&'static str> = Some("pings");
    }
}
