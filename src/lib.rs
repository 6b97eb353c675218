pub mod config;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod relay;
pub mod util;
pub mod test_util;
