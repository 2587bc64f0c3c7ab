use std::{
    error::Error,
    io::{self, Write},
};

use clap::Parser;
use nativewire::{
    Block, Command, prompt,
    client::{Client, ClientError, ClientOptions, QueryResult},
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address
    #[arg(default_value = "127.0.0.1:9000")]
    address: String,

    #[arg(long, default_value = "default")]
    user: String,

    #[arg(long, default_value = "")]
    password: String,

    #[arg(long, default_value = "")]
    database: String,

    /// Ask the server for chunked framing in both directions
    #[arg(long)]
    chunked: bool,
}

fn print_block(out: &mut impl Write, block: &Block) -> io::Result<()> {
    if block.columns().is_empty() {
        return Ok(());
    }
    let names: Vec<&str> = block.columns().iter().map(|c| c.name.as_str()).collect();
    writeln!(out, "{}", names.join("\t"))?;
    for row in 0..block.rows() {
        let values: Vec<String> = block
            .columns()
            .iter()
            .map(|c| c.column.value_string(row).unwrap_or_default())
            .collect();
        writeln!(out, "{}", values.join("\t"))?;
    }
    Ok(())
}

fn print_result(out: &mut impl Write, result: &QueryResult) -> io::Result<()> {
    for block in result.blocks.iter().filter(|b| !b.is_empty()) {
        print_block(out, block)?;
    }
    if let Some(totals) = &result.totals {
        writeln!(out, "totals:")?;
        print_block(out, totals)?;
    }
    writeln!(
        out,
        "{} rows in set, {} rows read",
        result.rows(),
        result.progress.read_rows
    )
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let framing = if cli.chunked { "chunked" } else { "notchunked_optional" };
    let mut client = Client::connect(
        cli.address.as_str(),
        ClientOptions {
            user: cli.user,
            password: cli.password,
            database: cli.database,
            proto_send_chunked: framing.to_string(),
            proto_recv_chunked: framing.to_string(),
            ..ClientOptions::default()
        },
    )?;
    let hello = client.server_hello();
    println!(
        "connected to {} {}.{} (revision {})",
        hello.display_name.as_deref().unwrap_or(&hello.name),
        hello.version_major,
        hello.version_minor,
        client.revision()
    );

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        let cmd = match prompt(stdin.lock(), &mut stdout) {
            Ok(cmd) => cmd,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        let outcome = match cmd {
            Command::Exit => break,
            Command::Ping => client.ping().map(|_| println!("pong")),
            Command::TablesStatus(tables) => client.tables_status(tables).map(|statuses| {
                for (table, status) in statuses {
                    println!(
                        "{}.{}: replicated {}, delay {}",
                        table.database, table.table, status.is_replicated, status.absolute_delay
                    );
                }
            }),
            Command::Query(query) if query.is_empty() => Ok(()),
            Command::Query(query) => client
                .query(&query)
                .map(|result| print_result(&mut stdout, &result).unwrap_or_default()),
        };

        match outcome {
            Ok(()) => {}
            Err(ClientError::Server(e)) => eprintln!("error {} ({}): {}", e.code, e.name, e.message),
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
