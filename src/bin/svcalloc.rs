fn main() -> anyhow::Result<()> {
    svcalloc_cmd::cmd::run()
}
