use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::mapper::{Mapper, Mirroring};

/// Parsed iNES / NES 2.0 image. Consumed by `create_mapper`; the mapper
/// takes ownership of the ROM and RAM payloads.
#[derive(Debug, Clone)]
pub struct Cartridge {
    pub mapper_id: u8,
    pub mirroring: Mirroring,
    pub four_screen: bool,
    pub battery: bool,
    pub prg_rom: Vec<u8>,
    pub chr: Vec<u8>,
    pub chr_is_ram: bool,
    pub prg_ram_size: usize,
    pub trainer: Option<Vec<u8>>,
}

impl Cartridge {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read ROM: {}", path.display()))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 16 {
            bail!("ROM is too small to contain an iNES header");
        }
        if &bytes[0..4] != b"NES\x1A" {
            bail!("invalid iNES header magic, expected NES<EOF>");
        }

        let prg_banks = bytes[4] as usize;
        let chr_banks = bytes[5] as usize;
        let flags6 = bytes[6];
        let flags7 = bytes[7];
        let is_nes2 = (flags7 & 0x0C) == 0x08;

        let mapper_id = (flags7 & 0xF0) | (flags6 >> 4);
        let four_screen = (flags6 & 0x08) != 0;
        let mirroring = if four_screen {
            Mirroring::FourScreen
        } else if (flags6 & 0x01) != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        };
        let trainer_present = (flags6 & 0x04) != 0;

        let (prg_ram_size, prg_nvram_size, chr_ram_size) = if is_nes2 {
            let ram_exp = bytes[10] & 0x0F;
            let nvram_exp = bytes[10] >> 4;
            let chr_ram_exp = bytes[11] & 0x0F;
            (
                shift_ram_size(ram_exp, 0),
                shift_ram_size(nvram_exp, 0),
                if chr_banks == 0 {
                    shift_ram_size(chr_ram_exp, 8 * 1024)
                } else {
                    0
                },
            )
        } else {
            let units = bytes[8] as usize;
            (
                if units == 0 { 8 * 1024 } else { units * 8 * 1024 },
                if (flags6 & 0x02) != 0 { 8 * 1024 } else { 0 },
                if chr_banks == 0 { 8 * 1024 } else { 0 },
            )
        };

        let battery = if is_nes2 {
            prg_nvram_size > 0
        } else {
            (flags6 & 0x02) != 0
        };

        let mut cursor = 16usize;
        let trainer = if trainer_present {
            if bytes.len() < cursor + 512 {
                bail!("ROM truncated: trainer declared but file ended early");
            }
            let data = bytes[cursor..cursor + 512].to_vec();
            cursor += 512;
            Some(data)
        } else {
            None
        };

        let prg_size = prg_banks.max(1) * 16 * 1024;
        if bytes.len() < cursor + prg_size {
            bail!("ROM truncated: expected {prg_size} PRG bytes but file ended early");
        }
        let prg_rom = bytes[cursor..cursor + prg_size].to_vec();
        cursor += prg_size;

        let (chr, chr_is_ram) = if chr_banks == 0 {
            (vec![0; chr_ram_size.max(8 * 1024)], true)
        } else {
            let chr_size = chr_banks * 8 * 1024;
            if bytes.len() < cursor + chr_size {
                bail!("ROM truncated: expected {chr_size} CHR bytes but file ended early");
            }
            (bytes[cursor..cursor + chr_size].to_vec(), false)
        };

        Ok(Self {
            mapper_id,
            mirroring,
            four_screen,
            battery,
            prg_rom,
            chr,
            chr_is_ram,
            prg_ram_size: prg_ram_size.max(prg_nvram_size),
            trainer,
        })
    }
}

// NES 2.0 RAM size nibble: 0 means "none" (or the given default), else
// 64 << (n - 1) bytes.
fn shift_ram_size(exponent: u8, default: usize) -> usize {
    if exponent == 0 {
        default
    } else {
        64usize << (exponent - 1)
    }
}

pub fn sav_path_for(rom_path: &Path) -> PathBuf {
    rom_path.with_extension("sav")
}

/// Fill battery-backed PRG-RAM from the sidecar save file, if one exists.
pub fn load_sram(mapper: &mut dyn Mapper, path: &Path) {
    let Some(ram) = mapper.prg_ram() else {
        return;
    };
    match fs::read(path) {
        Ok(bytes) => {
            let n = bytes.len().min(ram.len());
            ram[..n].copy_from_slice(&bytes[..n]);
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => log::warn!("failed to read save file {}: {err}", path.display()),
    }
}

/// Persist battery-backed PRG-RAM. Failures are logged, never propagated.
pub fn save_sram(mapper: &mut dyn Mapper, path: &Path) {
    let Some(ram) = mapper.prg_ram() else {
        return;
    };
    if let Err(err) = fs::write(path, &ram[..]) {
        log::warn!("failed to write save file {}: {err}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ines_image(prg_banks: u8, chr_banks: u8, flags6: u8, flags7: u8) -> Vec<u8> {
        let mut bytes = vec![0u8; 16];
        bytes[0..4].copy_from_slice(b"NES\x1A");
        bytes[4] = prg_banks;
        bytes[5] = chr_banks;
        bytes[6] = flags6;
        bytes[7] = flags7;
        if (flags6 & 0x04) != 0 {
            bytes.extend(std::iter::repeat(0xAB).take(512));
        }
        bytes.extend(std::iter::repeat(0x11).take(prg_banks as usize * 16 * 1024));
        bytes.extend(std::iter::repeat(0x22).take(chr_banks as usize * 8 * 1024));
        bytes
    }

    #[test]
    fn parses_basic_header() {
        let cart = Cartridge::from_bytes(&ines_image(2, 1, 0x01, 0x00)).unwrap();

        assert_eq!(cart.mapper_id, 0);
        assert_eq!(cart.mirroring, Mirroring::Vertical);
        assert!(!cart.battery);
        assert!(!cart.chr_is_ram);
        assert_eq!(cart.prg_rom.len(), 32 * 1024);
        assert_eq!(cart.chr.len(), 8 * 1024);
    }

    #[test]
    fn mapper_id_combines_both_nibbles() {
        let cart = Cartridge::from_bytes(&ines_image(1, 1, 0x40, 0x00)).unwrap();
        assert_eq!(cart.mapper_id, 4);

        let cart = Cartridge::from_bytes(&ines_image(1, 1, 0x10, 0x40)).unwrap();
        assert_eq!(cart.mapper_id, 0x41);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = ines_image(1, 1, 0, 0);
        bytes[0] = b'X';
        assert!(Cartridge::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_short_file() {
        assert!(Cartridge::from_bytes(&[0x4E, 0x45, 0x53]).is_err());
        let mut truncated = ines_image(2, 0, 0, 0);
        truncated.truncate(16 + 1024);
        assert!(Cartridge::from_bytes(&truncated).is_err());
    }

    #[test]
    fn zero_chr_banks_means_chr_ram() {
        let cart = Cartridge::from_bytes(&ines_image(1, 0, 0x00, 0x00)).unwrap();
        assert!(cart.chr_is_ram);
        assert_eq!(cart.chr.len(), 8 * 1024);
    }

    #[test]
    fn battery_and_four_screen_flags() {
        let cart = Cartridge::from_bytes(&ines_image(1, 1, 0x0A, 0x00)).unwrap();
        assert!(cart.battery);
        assert!(cart.four_screen);
        assert_eq!(cart.mirroring, Mirroring::FourScreen);
    }

    #[test]
    fn trainer_is_extracted_before_prg() {
        let cart = Cartridge::from_bytes(&ines_image(1, 1, 0x04, 0x00)).unwrap();

        let trainer = cart.trainer.expect("trainer present");
        assert_eq!(trainer.len(), 512);
        assert!(trainer.iter().all(|&b| b == 0xAB));
        assert!(cart.prg_rom.iter().all(|&b| b == 0x11));
    }

    #[test]
    fn nes2_prg_ram_exponents() {
        let mut bytes = ines_image(1, 1, 0x02, 0x08);
        // RAM nibble 7 -> 4 KiB, NVRAM nibble 8 -> 8 KiB.
        bytes[10] = 0x87;
        let cart = Cartridge::from_bytes(&bytes).unwrap();

        assert!(cart.battery);
        assert_eq!(cart.prg_ram_size, 8 * 1024);
    }

    #[test]
    fn ines_prg_ram_defaults_to_8k() {
        let cart = Cartridge::from_bytes(&ines_image(1, 1, 0x00, 0x00)).unwrap();
        assert_eq!(cart.prg_ram_size, 8 * 1024);
    }
}
