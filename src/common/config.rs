// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use crate::novaflow_config::config as novaflow_app_config;

pub(crate) fn log_filter() -> String {
    novaflow_app_config()
        .ok()
        .map(|c| c.effective_log_filter())
        .unwrap_or_else(|| "info".to_string())
}

pub(crate) fn exec_threads() -> usize {
    novaflow_app_config()
        .ok()
        .map(|c| c.runtime.actual_exec_threads())
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
}

pub(crate) fn use_threads() -> bool {
    novaflow_app_config()
        .ok()
        .map(|c| c.runtime.use_threads)
        .unwrap_or(true)
}

pub(crate) fn sink_pause_if_above_bytes() -> u64 {
    novaflow_app_config()
        .ok()
        .map(|c| c.runtime.sink_pause_if_above_bytes)
        .unwrap_or(1 << 30)
}

pub(crate) fn sink_resume_if_below_bytes() -> u64 {
    novaflow_app_config()
        .ok()
        .map(|c| c.runtime.sink_resume_if_below_bytes)
        .unwrap_or(1 << 28)
}
