// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! VibeTunnel is a web-accessible terminal multiplexer server. See the
//! crate-level docs on `vibetunnel-core` for the component breakdown; this
//! binary only parses flags and hands off to `vibetunnel_core::run`.

use clap::Parser;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Command-line flags accepted by the `vibetunnel` server binary.
#[derive(Parser, Debug)]
#[clap(author, version = VERSION, about = "VibeTunnel: a web-accessible terminal multiplexer")]
struct Args {
    #[clap(short, long, action, help = "The file to write logs to (stderr if unset)")]
    log_file: Option<String>,

    #[clap(short, long, action = clap::ArgAction::Count, help = "Show more in logs, may be provided multiple times")]
    verbose: u8,

    #[clap(short, long, action, help = "A toml file containing configuration")]
    config_file: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(vibetunnel_core::run(args.config_file, args.verbose, args.log_file))
}
