// Copyright 2024 autortfm contributors
// SPDX-License-Identifier: Apache-2.0

pub mod random;
