mod local_source;

pub use self::local_source::{LocalMediaSource, LocalStream};
