// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Command-line entry point.
//!
//! One subcommand per controller operation, invoked by the REST layer or by
//! hand on the gateway. Exit status is the operation's aggregate return
//! code.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use argh::FromArgs;
use gatewayd::board_config;
use gatewayd::AutotestOptions;
use gatewayd::GatewayManager;
use gatewayd::NodeId;

#[derive(FromArgs)]
/// Testbed gateway controller.
struct Args {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Setup(SetupArgs),
    Start(StartArgs),
    Stop(StopArgs),
    Autotest(AutotestArgs),
    Flash(FlashArgs),
    Reset(ResetArgs),
}

#[derive(FromArgs)]
/// Flash the control-node firmware, once at gateway bring-up.
#[argh(subcommand, name = "setup")]
struct SetupArgs {}

#[derive(FromArgs)]
/// Start an experiment.
#[argh(subcommand, name = "start")]
struct StartArgs {
    /// experiment id
    #[argh(option)]
    exp_id: u32,
    /// user owning the experiment
    #[argh(option)]
    user: String,
    /// firmware to flash on the open node (defaults to the idle firmware)
    #[argh(option)]
    firmware: Option<PathBuf>,
    /// JSON profile document (defaults to the gateway's default profile)
    #[argh(option)]
    profile: Option<PathBuf>,
    /// seconds before the experiment is stopped automatically (0: never)
    #[argh(option, default = "0")]
    timeout: u64,
}

#[derive(FromArgs)]
/// Stop the running experiment.
#[argh(subcommand, name = "stop")]
struct StopArgs {}

#[derive(FromArgs)]
/// Run the gateway self-diagnostic.
#[argh(subcommand, name = "autotest")]
struct AutotestArgs {
    /// radio channel for the radio tests
    #[argh(option)]
    channel: Option<u8>,
    /// leave the LEDs blinking on success
    #[argh(switch)]
    blink: bool,
    /// also test the on-board flash memory
    #[argh(switch)]
    flash: bool,
    /// also test the GPS PPS counter
    #[argh(switch)]
    gps: bool,
}

#[derive(FromArgs)]
/// Flash a firmware on a node.
#[argh(subcommand, name = "flash")]
struct FlashArgs {
    /// node to flash: gwt or m3
    #[argh(positional)]
    node: String,
    /// firmware file
    #[argh(positional)]
    firmware: PathBuf,
}

#[derive(FromArgs)]
/// Reset a node through its JTAG adapter.
#[argh(subcommand, name = "reset")]
struct ResetArgs {
    /// node to reset: gwt or m3
    #[argh(positional)]
    node: String,
}

fn parse_node(token: &str) -> anyhow::Result<NodeId> {
    match token {
        "gwt" => Ok(NodeId::ControlNode),
        "m3" => Ok(NodeId::OpenM3),
        other => anyhow::bail!("unknown node {:?}, expected gwt or m3", other),
    }
}

fn run(args: Args) -> anyhow::Result<i32> {
    let board = board_config::init_global().context("failed to load board configuration")?;
    let manager = GatewayManager::new(board.clone());

    let ret = match args.command {
        Command::Setup(_) => {
            manager.setup().context("gateway setup failed")?;
            0
        }
        Command::Start(start) => {
            let profile = match &start.profile {
                Some(path) => {
                    let text = fs::read_to_string(path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    Some(serde_json::from_str(&text).context("malformed profile document")?)
                }
                None => None,
            };
            manager.exp_start(
                start.exp_id,
                &start.user,
                start.firmware.as_deref(),
                profile.as_ref(),
                Duration::from_secs(start.timeout),
            )
        }
        Command::Stop(_) => manager.exp_stop(),
        Command::Autotest(autotest) => {
            let report = manager.auto_tests(AutotestOptions {
                channel: autotest.channel,
                blink: autotest.blink,
                flash: autotest.flash,
                gps: autotest.gps,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to render report")?
            );
            report.ret
        }
        Command::Flash(flash) => manager.node_flash(parse_node(&flash.node)?, &flash.firmware),
        Command::Reset(reset) => manager.node_soft_reset(parse_node(&reset.node)?),
    };
    Ok(ret)
}

fn main() -> ExitCode {
    env_logger::init();
    let args: Args = argh::from_env();
    match run(args) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("gatewayd: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
