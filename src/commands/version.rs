pub fn run() -> anyhow::Result<()> {
    println!("tekton-pruner-gc {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
