//! Cross-module tests
//!
//! Scenario tests that drive the whole pipeline against the virtual device,
//! plus randomized stress runs over buffer lifetimes and CPU fences.


use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::drivers::gem::{Bo, CpuAccess};
use crate::drivers::vkms::VirtualDrm;

/// Deterministic pixel for (`x`, `y`) so copies can be checked anywhere.
pub fn pattern(x: u32, y: u32, seed: u32) -> u32 {
    x.wrapping_mul(0x9e37_79b9) ^ y.wrapping_mul(0x85eb_ca6b) ^ seed
}

/// Fills `bo` with [`pattern`] as if it sat at (`x0`, `y0`).
pub fn paint(bo: &Bo, x0: u32, y0: u32, seed: u32) {
    let _guard = bo.cpu_access(CpuAccess::Write).unwrap();
    let pitch = bo.pitch() as usize;
    for y in 0..bo.height() {
        let row: Vec<u8> = (0..bo.width())
            .flat_map(|x| pattern(x0 + x, y0 + y, seed).to_ne_bytes())
            .collect();
        bo.write_bytes(y as usize * pitch, &row).unwrap();
    }
}

/// True when every pixel of `bo` holds the pattern for its placement.
pub fn holds_pattern(bo: &Bo, x0: u32, y0: u32, seed: u32) -> bool {
    let bytes = bo.to_vec().unwrap();
    let pitch = bo.pitch() as usize;
    (0..bo.height()).all(|y| {
        (0..bo.width()).all(|x| {
            let at = y as usize * pitch + x as usize * 4;
            bytes[at..at + 4] == pattern(x0 + x, y0 + y, seed).to_ne_bytes()
        })
    })
}

/// True when the `w`x`h` area of `bo` at (`x`, `y`) holds the pattern.
pub fn region_holds_pattern(bo: &Bo, x: u32, y: u32, w: u32, h: u32, seed: u32) -> bool {
    let bytes = bo.to_vec().unwrap();
    let pitch = bo.pitch() as usize;
    (y..y + h).all(|row| {
        (x..x + w).all(|col| {
            let at = row as usize * pitch + col as usize * 4;
            bytes[at..at + 4] == pattern(col, row, seed).to_ne_bytes()
        })
    })
}

pub fn device(crtcs: usize, modes: &[(u16, u16)]) -> Arc<VirtualDrm> {
    let mut builder = VirtualDrm::builder().crtcs(crtcs);
    for &(w, h) in modes {
        builder = builder.connector(11, w, h);
    }
    Arc::new(builder.build())
}
