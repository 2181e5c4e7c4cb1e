pub mod kv;
pub mod presence;
