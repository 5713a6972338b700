#![no_main]

use atlas_core::{Coord, SpatialTree};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(tree) = SpatialTree::from_bytes(data) else {
        return;
    };
    // A decoded tree may still be malformed; queries must error, never panic.
    let _ = tree.verify();
    if let Some(center) = Coord::from_slice(&[0.0f32; 4][..tree.axes().min(4)]) {
        let _ = tree.radius_query(&center, 1.0, |_| true);
    }
});
