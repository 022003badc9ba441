pub mod consumers;
pub mod env;
pub mod opportunities;
pub mod redis;
pub mod retries;
pub mod streams;
pub mod testing;
pub mod time;
