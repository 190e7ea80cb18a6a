// Copyright 2024 autortfm contributors
// SPDX-License-Identifier: Apache-2.0

use rand::Rng;

/// Byte vector with random contents and a random length in `1..max_len`.
pub fn bytestring(max_len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(1..max_len);
    (0..len).map(|_| rng.gen()).collect()
}
