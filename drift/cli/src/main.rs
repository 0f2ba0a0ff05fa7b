//! `drift` — the CLI entry point wrapping [`drift_session::Session`].

mod cli;
mod connect;
mod display;
mod error;
mod install_id;

use clap::{CommandFactory, Parser};
use cli::{AgentCommand, Cli, Command, InterceptCommand};
use error::CliError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let filter = EnvFilter::try_from_env("DRIFT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if std::env::var("DRIFT_LOG_FORMAT").as_deref() == Ok("json") {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let cli = Cli::parse();

    if let Command::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "drift", &mut std::io::stdout());
        return;
    }

    if let Err(error) = run(cli).await {
        tracing::error!(%error, "command failed");
        std::process::exit(error.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Connect => run_connect(&cli.connect).await,
        Command::Disconnect => run_disconnect(&cli.connect).await,
        Command::Status => run_status(&cli.connect).await,
        Command::Intercept { action } => run_intercept(&cli.connect, action).await,
        Command::Agent { action } => run_agent(&cli.connect, action).await,
        Command::Completions { .. } => unreachable!("handled before run()"),
    }
}

async fn run_connect(args: &cli::ConnectArgs) -> Result<(), CliError> {
    let session = connect::connect(args).await?;
    eprintln!("connected: session {}", session.session_id());

    let mut ended = session.subscribe_ended();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = ended.changed() => {
            eprintln!("session ended by the manager: {:?}", *ended.borrow());
        }
    }

    session.disconnect().await;
    Ok(())
}

async fn run_disconnect(args: &cli::ConnectArgs) -> Result<(), CliError> {
    let session = connect::connect(args).await?;
    session.disconnect().await;
    eprintln!("disconnected");
    Ok(())
}

async fn run_status(args: &cli::ConnectArgs) -> Result<(), CliError> {
    let session = connect::connect(args).await?;
    let counters = session.counters();
    println!("session:            {}", session.session_id());
    println!("intercepts active:  {}", counters.intercepts_active);
    println!("forwards active:    {}", counters.forwards_active);
    println!("mounts active:      {}", counters.mounts_active);
    println!("stream reconnects:  {}", counters.stream_reconnects);
    session.disconnect().await;
    Ok(())
}

async fn run_intercept(connect_args: &cli::ConnectArgs, action: InterceptCommand) -> Result<(), CliError> {
    match action {
        InterceptCommand::List => {
            let session = connect::connect(connect_args).await?;
            let records = session.list_intercepts().await;
            display::intercepts(&records);
            session.disconnect().await;
            Ok(())
        }
        InterceptCommand::Remove { name } => {
            let session = connect::connect(connect_args).await?;
            session.remove_intercept(&name).await?;
            session.disconnect().await;
            eprintln!("removed intercept \"{name}\"");
            Ok(())
        }
        InterceptCommand::Add(add_args) => {
            let session = connect::connect(connect_args).await?;

            let spec = drift_session::InterceptSpecInput {
                name: add_args.name.clone(),
                workload_namespace: add_args.workload_namespace,
                workload_name: add_args.workload,
                target_host: add_args.target_host,
                target_port: add_args.target_port,
                mechanism: add_args.mechanism,
                mechanism_args: add_args.mechanism_args,
                local_ports: add_args.local_ports,
                mount_point: add_args.mount_point,
                no_agent: false,
            };

            let record = match session.add_intercept(spec).await {
                Ok(record) => record,
                Err(error) => {
                    session.disconnect().await;
                    return Err(error.into());
                }
            };
            display::intercepts(&[record]);

            eprintln!("intercept \"{}\" active, press Ctrl-C to remove it", add_args.name);
            tokio::signal::ctrl_c().await.ok();

            session.remove_intercept(&add_args.name).await.ok();
            session.disconnect().await;
            Ok(())
        }
    }
}

async fn run_agent(connect_args: &cli::ConnectArgs, action: AgentCommand) -> Result<(), CliError> {
    match action {
        AgentCommand::List => {
            let session = connect::connect(connect_args).await?;
            let records = session.list_agents().await;
            display::agents(&records);
            session.disconnect().await;
            Ok(())
        }
    }
}
