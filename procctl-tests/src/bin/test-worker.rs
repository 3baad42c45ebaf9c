// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

fn main() {
    procctl::worker::worker_main(&procctl_tests::jobs::registry())
}
