use azure_services_console::{app, Config};
use std::io::{self, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let config = Config::from_args(std::env::args_os())?;
    let credential = config.credential();

    let mut console = app::Console::new(BufReader::new(io::stdin()), io::stdout());
    app::run(&config, credential, &mut console).await
}
