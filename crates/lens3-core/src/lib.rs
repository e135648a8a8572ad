pub mod config;
pub mod naming;
pub mod util;

pub use config::{Lens3Config, ManagerConf, MuxConf, RedisConf};
pub use naming::*;
pub use util::*;
