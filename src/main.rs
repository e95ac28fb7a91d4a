use clap::Parser;

use roost::cli::{Cli, Command};
use roost::config;
use roost::daemon::{self, DaemonClient};
use roost::handlers::{CreateReply, CreateRequest};
use roost::logging::{self, LogMode};
use roost::progress::CreateProgress;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Command::Serve) {
        let file_handle = logging::init(LogMode::Daemon {
            verbose: cli.verbose,
        });
        let config = config::load_config(&config::config_path(cli.config.as_deref()))?;

        let logs_dir = roost::paths::logs_dir();
        std::fs::create_dir_all(&logs_dir).ok();
        if let Err(e) = file_handle.set_file(&logs_dir.join("roostd.log")) {
            tracing::warn!(error = %e, "file logging disabled");
        }

        daemon::run_serve(config).await?;
        return Ok(());
    }

    logging::init(LogMode::Client {
        verbose: cli.verbose,
    });

    if matches!(cli.command, Command::Version) {
        println!("roost  {}", env!("CARGO_PKG_VERSION"));
        if let Ok(client) = daemon::connect()
            && let Ok(version) = client.version().await
        {
            println!("roostd {version}");
        }
        return Ok(());
    }

    let client = daemon::connect()?;
    run_command(&client, cli.command).await;
    Ok(())
}

/// RPC-level failure: message on stderr, exit code 1.
fn command_failed(verb: &str, err: impl std::fmt::Display) -> ! {
    eprintln!("failed to {verb}: {err}");
    std::process::exit(1);
}

async fn run_command(client: &DaemonClient, command: Command) {
    match command {
        Command::Serve | Command::Version => unreachable!(),
        Command::Create {
            image,
            name,
            cpus,
            mem,
            disk,
        } => {
            let request = CreateRequest {
                image: image.unwrap_or_default(),
                name: name.unwrap_or_default(),
                num_cores: cpus.unwrap_or(0),
                mem_size: mem.unwrap_or_default(),
                disk_space: disk.unwrap_or_default(),
            };
            let mut progress = CreateProgress::start(&request.image);
            let (tx, mut rx) = roam::channel::<CreateReply>();
            let (result, ()) = tokio::join!(client.create(request, tx), async {
                while let Ok(Some(reply)) = rx.recv().await {
                    progress.update(&reply);
                }
            });
            match result {
                Ok(name) => {
                    if let Some(message) = progress.finish() {
                        eprintln!("{message}");
                    }
                    println!("Launched: {name}");
                }
                Err(e) => {
                    progress.fail();
                    command_failed("create", e);
                }
            }
        }
        Command::Start { name } => match client.start(name).await {
            Ok(msg) => println!("{msg}"),
            Err(e) => command_failed("start", e),
        },
        Command::Stop { name } => match client.stop(name).await {
            Ok(msg) => println!("{msg}"),
            Err(e) => command_failed("stop", e),
        },
        Command::Trash { name } => match client.trash(name).await {
            Ok(msg) => println!("{msg}"),
            Err(e) => command_failed("trash", e),
        },
        Command::Recover { name } => match client.recover(name).await {
            Ok(msg) => println!("{msg}"),
            Err(e) => command_failed("recover", e),
        },
        Command::EmptyTrash => match client.empty_trash().await {
            Ok(msg) => println!("{msg}"),
            Err(e) => command_failed("empty trash", e),
        },
        Command::Exec { name, args } => match client.exec(name, args).await {
            Ok(output) => {
                print!("{}", output.stdout);
                eprint!("{}", output.stderr);
                std::process::exit(output.exit_code);
            }
            Err(e) => command_failed("exec", e),
        },
        Command::List => match client.list().await {
            Ok(instances) if instances.is_empty() => println!("No instances found."),
            Ok(instances) => {
                println!("{:<24} {}", "Name", "State");
                for i in instances {
                    println!("{:<24} {}", i.name, i.status);
                }
            }
            Err(e) => command_failed("list", e),
        },
        Command::Info { name } => match client.info(name).await {
            Ok(info) => {
                println!("{:<14} {}", "Name:", info.name);
                println!("{:<14} {}", "State:", info.status);
                println!("{:<14} {}", "Release:", info.release);
                println!("{:<14} {}", "Image hash:", info.image_id);
                println!("{:<14} {}", "Image version:", info.image_version);
                println!("{:<14} {}", "CPUs:", info.num_cores);
                println!("{:<14} {}", "Memory:", info.mem_size);
                let disk = if info.disk_space == 0 {
                    "image default".to_string()
                } else {
                    roost::util::format_size(info.disk_space)
                };
                println!("{:<14} {}", "Disk:", disk);
                println!("{:<14} {}", "SSH port:", info.ssh_port);
            }
            Err(e) => command_failed("get info", e),
        },
        Command::Find => match client.find().await {
            Ok(images) => {
                println!("{:<28} {:<10} {:<10} {}", "Aliases", "Release", "Version", "Id");
                for image in images {
                    let id: String = image.id.chars().take(12).collect();
                    println!(
                        "{:<28} {:<10} {:<10} {}",
                        image.aliases.join(","),
                        image.release,
                        image.version,
                        id
                    );
                }
            }
            Err(e) => command_failed("find images", e),
        },
    }
}
