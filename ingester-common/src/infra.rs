// This file is part of invest-ingester.
// Copyright (C) 2025 invest-ingester contributors
// SPDX-License-Identifier: Apache-2.0

pub mod pool;
