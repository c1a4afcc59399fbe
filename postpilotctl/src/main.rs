use clap::Parser;

fn main() {
    dotenvy::dotenv().ok();
    let cli = postpilotctl::Cli::parse();
    let log_file = postpilotctl::LogFile::resolve(&cli);
    let guard = match postpilotctl::init_tracing(cli.verbose, cli.log_format, log_file.as_ref()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    };
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to start runtime: {err}");
            std::process::exit(1);
        }
    };
    let result = runtime.block_on(postpilotctl::run(cli));
    drop(guard);
    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
