mod sleep_handle;

pub use self::sleep_handle::*;
