use netcode_host_demo::config::Cli;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> anyhow::Result<()> {
    let config = Cli::load()?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.host.max_clients == 0 {
        log::warn!("max_clients is 0, no client will ever be admitted");
        return Ok(());
    }

    netcode_host_demo::startup(config)
}
