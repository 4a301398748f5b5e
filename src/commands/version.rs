pub fn run() -> anyhow::Result<()> {
    println!("tracedock v{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
