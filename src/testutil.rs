// SPDX-License-Identifier: MIT OR Apache-2.0

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A unique path in the temp directory for a scratch pack image.
/// Any leftover file from an earlier run is removed.
pub fn scratch_path(tag: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let count = COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = env::temp_dir().join(format!(
        "mfdlib-{}-{}-{}.img",
        process::id(),
        tag,
        count
    ));
    let _ = fs::remove_file(&path);
    path
}
