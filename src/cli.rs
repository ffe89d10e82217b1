//! Line-oriented REPL (spec §4.H), grounded on the source's `Chat` class: a command table keyed
//! by `-flag` strings, `@target` for messages, and anything else treated as a broadcast to
//! `@all`.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::controller::{Controller, Target};
use crate::roster::Transport;

const HELP: &str = "\
Commands:
  -h  | -help                   Show this help message
  -q  | -quit | -exit           Exit the program
  -lu | -listusers              Show currently known users
  -lg | -listgroups             Show known groups
  -delay <seconds> <message>    Send <message> to @all, delayed by <seconds>
  -finduser <user>              Search for a user
  -findgroup <group>            Search for a group
  -creategroup <group>          Create and join a new group
  -joingroup <group>            Join an existing group
  -leavegroup <group>           Leave a group (not 'all')

  @<user>                       Send a direct message to <user>
  @<group>                      Send a message to every member of <group>
  <anything else>               Send a message to @all";

/// Runs the REPL to completion (until `-q`/EOF). Each line is parsed per spec §6 and dispatched
/// to the controller; nothing here touches the COM or roster directly.
pub async fn run<T: Transport>(controller: std::sync::Arc<Controller<T>>) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    println!("{} connected. Type -h for help.", controller.user_name());
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            println!("Note: The empty string is not a valid input");
            continue;
        }
        if let Some(rest) = line.strip_prefix('-') {
            if handle_command(&controller, rest).await {
                break;
            }
        } else if let Some(rest) = line.strip_prefix('@') {
            handle_at(&controller, rest).await;
        } else {
            controller
                .handle_outgoing(&Target::Group("all".to_string()), format!("MSG @all {}> {line}", controller.user_name()), Duration::ZERO)
                .await;
        }
    }
    Ok(())
}

/// Returns `true` when the REPL should exit.
async fn handle_command<T: Transport>(controller: &Controller<T>, rest: &str) -> bool {
    let mut parts = rest.splitn(2, ' ');
    let command = parts.next().unwrap_or("");
    let arg = parts.next().unwrap_or("").trim();

    match command {
        "h" | "help" => println!("{HELP}"),
        "q" | "quit" | "exit" => return true,
        "lu" | "listusers" => print_rows(controller.list_users().await),
        "lg" | "listgroups" => print_rows(controller.list_groups().await),
        "finduser" => print_rows(controller.find_user(arg).await),
        "findgroup" => print_rows(controller.find_group(arg).await),
        "creategroup" => report(controller.create_group(arg).await),
        "joingroup" => report(controller.join_group(arg).await),
        "leavegroup" => report(controller.leave_group(arg).await),
        "delay" => handle_delay(controller, arg).await,
        other => println!("Error: Unknown command -{other}. Enter -h or -help for a list of commands"),
    }
    false
}

async fn handle_delay<T: Transport>(controller: &Controller<T>, arg: &str) {
    let mut parts = arg.splitn(2, ' ');
    let Some(seconds) = parts.next().and_then(|s| s.parse::<u64>().ok()) else {
        println!("Error: The delay in the '-delay' command must be a number. For example: -delay 10 hi");
        return;
    };
    let Some(message) = parts.next().filter(|m| !m.trim().is_empty()) else {
        println!("Note: Empty messages are not sent");
        return;
    };
    let full = format!("MSG @all {}> {message}", controller.user_name());
    controller.handle_outgoing(&Target::Group("all".to_string()), full, Duration::from_secs(seconds)).await;
}

async fn handle_at<T: Transport>(controller: &Controller<T>, rest: &str) {
    let mut parts = rest.splitn(2, ' ');
    let target = parts.next().unwrap_or("");
    let Some(body) = parts.next().filter(|m| !m.trim().is_empty()) else {
        println!("Note: Empty messages are not sent");
        return;
    };
    let message = format!("MSG @{target} {}> {body}", controller.user_name());
    controller.handle_outgoing(&Target::parse(target), message, Duration::ZERO).await;
}

fn print_rows(rows: Vec<(String, Vec<String>)>) {
    if rows.is_empty() {
        println!("(none)");
        return;
    }
    for (name, related) in rows {
        println!("{name}: {}", related.join(", "));
    }
}

fn report(result: Result<(), crate::error::ChatError>) {
    if let Err(e) = result {
        println!("Error: {e}");
    }
}
