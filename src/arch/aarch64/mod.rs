pub use self::cache::*;

mod cache;
