// This file is part of invest-ingester.
// Copyright (C) 2025 invest-ingester contributors
// SPDX-License-Identifier: Apache-2.0

/// Initialize logging to stderr, filtered via the `RUST_LOG` environment variable.
pub fn init_logging() {
    logforth::starter_log::stderr().apply();
}
