use proxy_core::{LogicPatches, Target};

/// Lossless Scaling's frame generation module, which keeps its shaders as
/// `RT_RCDATA` resources.
pub struct LosslessScaling;

/// Sites whose two-byte instructions are replaced with `nop`s when an addon
/// asks for the host logic to be patched.
const LOGIC_PATCH_SITES: &[usize] = &[
    0x51ac, 0x59c6, 0x5ab7, 0x5bc9, 0x5ce2, 0x65ec, 0x6f04, 0x6fe7, 0x78a7, 0x7f86, 0x8056,
    0x8128, 0x8201, 0x8bdc, 0x92f0, 0x941d, 0x9d6c, 0xa480, 0xa589,
];

impl Target for LosslessScaling {
    const MODULE: &'static str = "Lossless_original.dll";

    const LOGIC_PATCHES: LogicPatches = LogicPatches {
        sites: LOGIC_PATCH_SITES,
        bytes: &[0x90, 0x90],
    };
}
