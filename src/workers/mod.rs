// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! The support threads.
//!
//! Three fixed threads take every operation that could block off the
//! shards' hands: [`app_log`] appends application log messages to
//! disk, [`query_log`] drains and persists the shards' query-log
//! double buffers, and [`resource`] watches resource files and
//! publishes reloaded artifacts to every shard.

pub mod app_log;
pub mod query_log;
pub mod resource;
