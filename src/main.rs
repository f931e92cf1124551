fn main() -> anyhow::Result<()> {
    mcs_gateway::cli::run_cli()
}
