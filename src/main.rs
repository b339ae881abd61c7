use diapoll::cli;

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let matches = cli::parse_args();

    if cli::actions::run_one_shot_actions(&matches)? {
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(cli::actions::run_engine(&matches))
}
