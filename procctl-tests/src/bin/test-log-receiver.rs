// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

fn main() -> anyhow::Result<()> {
    procctl::log_receiver::cli_main()
}
