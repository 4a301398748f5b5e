use tracedock::runtime::DockerApi;

pub async fn run() -> anyhow::Result<()> {
    println!("Running container runtime checks...\n");

    // 1. Build Docker client from the local environment
    print!("  Docker socket ............... ");
    let api = match DockerApi::connect() {
        Ok(api) => {
            println!("OK");
            api
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot build Docker client: {}", e);
        }
    };

    // 2. Verify the daemon actually answers
    print!("  Daemon ping ................. ");
    match api.ping().await {
        Ok(()) => println!("OK"),
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {}", e);
            println!("  Hint:  Is the Docker daemon running? Check with: docker info\n");
            return Ok(());
        }
    }

    println!("\nAll checks completed.");
    Ok(())
}
