pub mod remote;
pub mod server;
pub mod util;

#[cfg(test)]
mod test_util;
