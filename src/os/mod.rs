#[cfg(unix)]
pub mod mem;
