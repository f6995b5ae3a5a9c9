/*
 * Copyright (C) 2024 The vmctl Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::process;

use clap::Parser;
use vmctl::vmctl::cli::args::VmCtl;
use vmctl::vmctl::cli::commands;

#[tokio::main]
async fn main() {
    let cli = VmCtl::parse();
    if let Err(err) = commands::run(&cli.command).await {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}
