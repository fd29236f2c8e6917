// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Default instance identity.
//!
//! Resolution order: `HOSTNAME`, then the system hostname, then `"unknown"`.

use std::env;
use tracing::warn;

#[must_use]
pub fn get_hostname() -> String {
    if let Ok(hostname) = env::var("HOSTNAME") {
        if !hostname.trim().is_empty() {
            return hostname;
        }
    }

    #[cfg(unix)]
    match nix::unistd::gethostname() {
        Ok(name) => {
            if let Some(name) = name.to_str() {
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
        Err(e) => warn!("Failed to get system hostname: {e}"),
    }

    warn!("Could not determine hostname, using 'unknown' as instance id");
    "unknown".to_string()
}
