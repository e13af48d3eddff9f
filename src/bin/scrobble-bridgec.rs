use std::{
    env,
    io::{BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    path::PathBuf,
};

use serde_json::json;

fn runtime_dir() -> String {
    env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| {
        let uid = nix::unistd::Uid::current().as_raw();
        format!("/run/user/{uid}")
    })
}

fn socket_path() -> PathBuf {
    PathBuf::from(format!(
        "{}/scrobble-bridge/scrobble-bridge.sock",
        runtime_dir()
    ))
}

fn send_over_socket(payload: &str) -> std::io::Result<String> {
    let mut stream = UnixStream::connect(socket_path())?;
    stream.write_all(payload.as_bytes())?;
    stream.write_all(b"\n")?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    Ok(line)
}

fn send_and_print(payload: &str) {
    match send_over_socket(payload) {
        Ok(reply) => println!("{}", reply.trim_end()),
        Err(e) => {
            eprintln!(
                "scrobble-bridgec: cannot reach daemon at {} ({e}); is scrobble-bridged running?",
                socket_path().display()
            );
            std::process::exit(1);
        }
    }
}

fn usage() {
    eprintln!(
        "{}",
        r#"Usage:
  scrobble-bridgec status
  scrobble-bridgec start
  scrobble-bridgec stop
  scrobble-bridgec get-config
  scrobble-bridgec set-config [--user <name>] [--api-key <key>] [--client-id <id>]

set-config changes only the flags you pass, saves the merged config and
restarts the presence pipeline with it."#
    );
}

fn main() {
    let mut args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        usage();
        std::process::exit(2);
    }

    let cmd = args.remove(0);
    match cmd.as_str() {
        "status" | "start" | "stop" | "get-config" => {
            send_and_print(&json!({ "cmd": cmd }).to_string());
        }
        "set-config" => {
            let mut user: Option<String> = None;
            let mut api_key: Option<String> = None;
            let mut client_id: Option<String> = None;

            let mut i = 0;
            while i < args.len() {
                match args[i].as_str() {
                    "--user" if i + 1 < args.len() => {
                        user = Some(args.remove(i + 1));
                        args.remove(i);
                    }
                    "--api-key" if i + 1 < args.len() => {
                        api_key = Some(args.remove(i + 1));
                        args.remove(i);
                    }
                    "--client-id" if i + 1 < args.len() => {
                        client_id = Some(args.remove(i + 1));
                        args.remove(i);
                    }
                    _ => i += 1,
                }
            }

            if user.is_none() && api_key.is_none() && client_id.is_none() {
                usage();
                std::process::exit(2);
            }

            send_and_print(
                &json!({
                    "cmd": "set-config",
                    "user": user,
                    "api_key": api_key,
                    "client_id": client_id,
                })
                .to_string(),
            );
        }
        _ => {
            usage();
            std::process::exit(2);
        }
    }
}
