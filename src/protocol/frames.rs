// Copyright 2025 jonefeewang@gmail.com
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

use crate::define_record;
use crate::protocol::record::Record;

/// Encoded size of a [`HeadRecord`].
pub const HEAD_LENGTH: usize = 14;

define_record! {
    /// What a frame asks the device to do.
    pub struct CommandRecord {
        [1] pub category: u8,
        [2] pub command: u8,
    }
}

define_record! {
    /// Outcome reported back for a command.
    pub struct StatusRecord {
        [1] pub category: u8,
        [2] pub status: u8,
    }
}

define_record! {
    pub struct CheckRecord {
        [1] pub check_sum: u8,
        [2] pub check_xor: u8,
    }
}

define_record! {
    /// Fixed prefix of every socket frame. `length` counts the content bytes only.
    pub struct HeadRecord {
        [1] pub length: i64,
        [2] pub command: CommandRecord,
        [3] pub status: StatusRecord,
        [4] pub check: CheckRecord,
    }
}

impl CommandRecord {
    pub fn new(category: u8, command: u8) -> Self {
        CommandRecord {
            category,
            command,
            ..Default::default()
        }
        .sealed()
    }
}

impl StatusRecord {
    pub fn new(category: u8, status: u8) -> Self {
        StatusRecord {
            category,
            status,
            ..Default::default()
        }
        .sealed()
    }
}

impl CheckRecord {
    pub fn new(check_sum: u8, check_xor: u8) -> Self {
        CheckRecord {
            check_sum,
            check_xor,
            ..Default::default()
        }
        .sealed()
    }

    /// Wrapping byte sum and running xor over `content`.
    pub fn compute(content: &[u8]) -> Self {
        let (check_sum, check_xor) = content
            .iter()
            .fold((0u8, 0u8), |(sum, xor), byte| {
                (sum.wrapping_add(*byte), xor ^ byte)
            });
        CheckRecord::new(check_sum, check_xor)
    }

    /// Whether `content` produces this check.
    pub fn matches(&self, content: &[u8]) -> bool {
        let expected = CheckRecord::compute(content);
        expected.check_sum == self.check_sum && expected.check_xor == self.check_xor
    }
}

impl HeadRecord {
    pub fn new(
        length: i64,
        command: CommandRecord,
        status: StatusRecord,
        check: CheckRecord,
    ) -> Self {
        HeadRecord {
            length,
            command,
            status,
            check,
            ..Default::default()
        }
        .sealed()
    }

    /// Content length as a buffer size; `None` when the head carries a negative length.
    pub fn content_length(&self) -> Option<usize> {
        usize::try_from(self.length).ok()
    }
}
