// Copyright 2023 宋昊文
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

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counter handing out ids that are never reused.
pub struct IdGenerator {
    i: AtomicU64,
}

impl IdGenerator {
    pub const fn new() -> IdGenerator {
        IdGenerator {
            i: AtomicU64::new(1),
        }
    }

    pub fn generate(&self) -> u64 {
        self.i.fetch_add(1, Ordering::Relaxed)
    }
}
