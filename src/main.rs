fn main() -> anyhow::Result<()> {
    scanhead_lib::run()
}
