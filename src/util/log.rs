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

extern crate log;

/// Debug trace for a component, `tag` is used as the log target.
///
/// Messages are formatted by the caller so that call sites stay identical
/// regardless of whether a logger is installed.
pub fn platform_log<M>(tag: &str, message: M)
where
    M: AsRef<str>,
{
    ::log::debug!(target: tag, "{}", message.as_ref());
}

pub fn platform_warn<M>(tag: &str, message: M)
where
    M: AsRef<str>,
{
    ::log::warn!(target: tag, "{}", message.as_ref());
}
