// Copyright (C) 2024, 2025 Etherpool Developers (see AUTHORS)
//
// This file is part of Etherpool
//
// Etherpool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Etherpool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// Etherpool. If not, see <https://www.gnu.org/licenses/>.

use crate::util::target_hex_to_diff;
use num_bigint::BigUint;

/// Header entries kept for late shares while the tip advances.
const MAX_BACK_HEADERS: usize = 8;

#[derive(Debug, Clone)]
pub struct HeaderDetail {
    pub diff: BigUint,
    pub height: u64,
}

/// The work currently handed to miners. Replaced atomically on refresh and
/// immutable once published.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub header: String,
    pub seed: String,
    pub target: String,
    pub difficulty: BigUint,
    pub height: u64,
    /// FIFO map headerHash → (height, difficulty) of recent templates
    headers: Vec<(String, HeaderDetail)>,
}

impl BlockTemplate {
    /// Build the next template, carrying the previous template's header
    /// entries so slightly-stale shares still resolve.
    pub fn next(
        prev: Option<&BlockTemplate>,
        header: String,
        seed: String,
        target: String,
        height: u64,
    ) -> Self {
        let difficulty = target_hex_to_diff(&target);
        let mut headers = prev.map(|p| p.headers.clone()).unwrap_or_default();
        headers.push((
            header.clone(),
            HeaderDetail {
                diff: difficulty.clone(),
                height,
            },
        ));
        while headers.len() > MAX_BACK_HEADERS {
            headers.remove(0);
        }
        Self {
            header,
            seed,
            target,
            difficulty,
            height,
            headers,
        }
    }

    pub fn header_detail(&self, header: &str) -> Option<&HeaderDetail> {
        self.headers
            .iter()
            .find(|(h, _)| h.eq_ignore_ascii_case(header))
            .map(|(_, d)| d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::get_target_hex;

    fn template_chain(n: usize) -> BlockTemplate {
        let mut prev: Option<BlockTemplate> = None;
        for i in 0..n {
            let t = BlockTemplate::next(
                prev.as_ref(),
                format!("0x{:064x}", i),
                "0xseed".to_string(),
                get_target_hex(1_000_000),
                100 + i as u64,
            );
            prev = Some(t);
        }
        prev.unwrap()
    }

    #[test]
    fn test_template_parses_difficulty_from_target() {
        let t = BlockTemplate::next(
            None,
            "0xabc".to_string(),
            "0xdef".to_string(),
            get_target_hex(2_000_000_000),
            5,
        );
        assert_eq!(t.difficulty, BigUint::from(2_000_000_000u64));
    }

    #[test]
    fn test_previous_header_remains_valid() {
        let t = template_chain(3);
        // current and the two previous headers resolve
        assert_eq!(t.header_detail(&format!("0x{:064x}", 2)).unwrap().height, 102);
        assert_eq!(t.header_detail(&format!("0x{:064x}", 1)).unwrap().height, 101);
        assert_eq!(t.header_detail(&format!("0x{:064x}", 0)).unwrap().height, 100);
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let t = template_chain(1);
        let upper = format!("0x{:064X}", 0);
        assert!(t.header_detail(&upper).is_some());
    }

    #[test]
    fn test_headers_evict_fifo_at_capacity() {
        let t = template_chain(12);
        // the four oldest entries fell off
        for i in 0..4 {
            assert!(t.header_detail(&format!("0x{:064x}", i)).is_none());
        }
        for i in 4..12 {
            assert!(t.header_detail(&format!("0x{:064x}", i)).is_some());
        }
    }
}
