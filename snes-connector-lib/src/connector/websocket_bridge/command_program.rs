//! 65816 programs that perform work RAM writes on hardware which only lets
//! the bridge write into its command area.

pub(super) const COMMAND_SPACE: &str = "CMD";
pub(super) const COMMAND_ADDRESS: u32 = 0x2C00;

const SEI: u8 = 0x78;
const CLI: u8 = 0x58;
const PHP: u8 = 0x08;
const PLP: u8 = 0x28;
const PHA: u8 = 0x48;
const PLA: u8 = 0x68;
const REP: u8 = 0xC2;
const SEP: u8 = 0xE2;
const LDA_IMMEDIATE: u8 = 0xA9;
const STA_LONG: u8 = 0x8F;
const JMP_INDIRECT: u8 = 0x6C;
const M_FLAG: u8 = 0x20;
/// NMI vector the hook returns through.
const NMI_VECTOR: u16 = 0xFFEA;

/// Builds a program storing `data` at `address` (a linear bus address, e.g.
/// 0x7E0010), one immediate load and long store per byte.
pub(super) fn write_program(address: u32, data: &[u8]) -> Vec<u8> {
    let mut program = Vec::with_capacity(20 + data.len() * 6);
    program.extend([SEI, PHP, REP, M_FLAG, PHA, SEP, M_FLAG]);
    for (index, value) in data.iter().enumerate() {
        let [low, high, bank, _] = (address + index as u32).to_le_bytes();
        program.extend([LDA_IMMEDIATE, *value, STA_LONG, low, high, bank]);
    }
    // clear the trigger byte so the hook runs the program only once
    let [low, high, bank, _] = COMMAND_ADDRESS.to_le_bytes();
    program.extend([LDA_IMMEDIATE, 0x00, STA_LONG, low, high, bank]);
    let [vector_low, vector_high] = NMI_VECTOR.to_le_bytes();
    program.extend([REP, M_FLAG, PLA, PLP, CLI, JMP_INDIRECT, vector_low, vector_high]);
    program
}
