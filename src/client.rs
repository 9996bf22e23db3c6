use std::io::{Read, Write};
use std::net::{IpAddr, Shutdown, TcpStream};

use crate::config::WadesConfig;

/// Sends one protocol command to the daemon and returns the raw payload.
pub fn send_request(address: IpAddr, port: u16, request: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect((address, port))?;
    stream.write_all(request.as_bytes())?;
    stream.shutdown(Shutdown::Write)?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    Ok(response)
}

/// Sends a command and pretty-prints the JSON response. Exits non-zero
/// when the daemon is unreachable or the response is malformed.
pub fn run_query_command(config: &WadesConfig, request: &str) {
    let payload = match send_request(config.query_bind_address, config.query_port, request) {
        Ok(payload) => payload,
        Err(err) => {
            eprintln!(
                "Could not reach the wades daemon at {}:{}: {}",
                config.query_bind_address, config.query_port, err
            );
            eprintln!("Is the daemon running? Try `wades start`.");
            std::process::exit(1)
        }
    };
    match serde_json::from_str::<serde_json::Value>(&payload) {
        Ok(value) => println!(
            "{}",
            serde_json::to_string_pretty(&value).expect("re-encoding parsed JSON cannot fail")
        ),
        Err(err) => {
            eprintln!("Malformed response from the daemon: {err}");
            std::process::exit(1)
        }
    }
}
