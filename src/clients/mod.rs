pub mod forms;
pub mod redis;

pub use forms::*;
pub use self::redis::*;
