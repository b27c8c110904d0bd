pub mod build_info;
pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod daemon;
pub mod logging;
pub mod ops;
pub mod options;
pub mod procfile;
pub mod process;
pub mod project;
pub mod server;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod tables;

pub fn main() -> anyhow::Result<()> {
    cli::run()
}
