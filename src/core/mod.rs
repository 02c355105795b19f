//! 核心：错误类型与优雅关闭

pub mod error;
pub mod shutdown;

pub use error::{AuthFailure, HubError};
pub use shutdown::{
    join_background, run_until_shutdown, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
    TransportCleanup, ValueStoreCleanup,
};
