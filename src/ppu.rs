//! 2C02 picture processor: loopy scroll registers, dot-exact background
//! fetch pipeline, per-line sprite evaluation and compositing, and the
//! per-dot A12 feed that drives mapper scanline counters.

use crate::mapper::{Mapper, Mirroring};
use crate::palette::NES_PALETTE;

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 240;

const CTRL_VRAM_INC_32: u8 = 0x04;
const CTRL_SPRITE_TABLE: u8 = 0x08;
const CTRL_BG_TABLE: u8 = 0x10;
const CTRL_SPRITE_SIZE_16: u8 = 0x20;
const CTRL_NMI_ENABLE: u8 = 0x80;

const MASK_SHOW_BG_LEFT: u8 = 0x02;
const MASK_SHOW_SPRITE_LEFT: u8 = 0x04;
const MASK_SHOW_BG: u8 = 0x08;
const MASK_SHOW_SPRITES: u8 = 0x10;

const STATUS_SPRITE_OVERFLOW: u8 = 0x20;
const STATUS_SPRITE_ZERO_HIT: u8 = 0x40;
const STATUS_VBLANK: u8 = 0x80;

pub struct Ppu {
    ctrl: u8,
    mask: u8,
    status: u8,

    oam_addr: u8,
    oam: [u8; 256],
    sec_oam: [u8; 32],
    sec_count: usize,

    vram: [u8; 4096],
    palette_ram: [u8; 32],

    // Loopy registers: 15-bit v/t, 3-bit fine X, shared write toggle.
    v: u16,
    t: u16,
    fine_x: u8,
    write_toggle: bool,
    read_buffer: u8,
    open_bus: u8,

    pub(crate) scanline: u16,
    pub(crate) dot: u16,
    odd_frame: bool,
    pub(crate) nmi_occurred: bool,

    // BG pipeline latches and shifters.
    nt_latch: u8,
    at_latch: u8,
    pat_lo_latch: u8,
    pat_hi_latch: u8,
    bg_shift_lo: u16,
    bg_shift_hi: u16,
    attr_shift_lo: u16,
    attr_shift_hi: u16,

    a12_this_dot: bool,

    // Per-scanline staging, composed into the frame buffer at line end.
    line_bg_color: [u8; FRAME_WIDTH],
    line_bg_pix: [u8; FRAME_WIDTH],
    line_sp_color: [u8; FRAME_WIDTH],
    line_sp_pix: [u8; FRAME_WIDTH],
    line_sp_behind: [bool; FRAME_WIDTH],
    line_sp0_mask: [bool; FRAME_WIDTH],

    frame_buffer: [u8; FRAME_WIDTH * FRAME_HEIGHT * 4],
}

impl Ppu {
    pub fn new() -> Self {
        Self {
            ctrl: 0,
            mask: 0,
            status: 0,
            oam_addr: 0,
            oam: [0xFF; 256],
            sec_oam: [0xFF; 32],
            sec_count: 0,
            vram: [0; 4096],
            palette_ram: [0x0F; 32],
            v: 0,
            t: 0,
            fine_x: 0,
            write_toggle: false,
            read_buffer: 0,
            open_bus: 0,
            scanline: 261,
            dot: 0,
            odd_frame: false,
            nmi_occurred: false,
            nt_latch: 0,
            at_latch: 0,
            pat_lo_latch: 0,
            pat_hi_latch: 0,
            bg_shift_lo: 0,
            bg_shift_hi: 0,
            attr_shift_lo: 0,
            attr_shift_hi: 0,
            a12_this_dot: false,
            line_bg_color: [0; FRAME_WIDTH],
            line_bg_pix: [0; FRAME_WIDTH],
            line_sp_color: [0; FRAME_WIDTH],
            line_sp_pix: [0; FRAME_WIDTH],
            line_sp_behind: [false; FRAME_WIDTH],
            line_sp0_mask: [false; FRAME_WIDTH],
            frame_buffer: [0; FRAME_WIDTH * FRAME_HEIGHT * 4],
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn frame_buffer(&self) -> &[u8] {
        &self.frame_buffer
    }

    pub(crate) fn nmi_output(&self) -> bool {
        (self.ctrl & CTRL_NMI_ENABLE) != 0
    }

    pub fn cpu_read_register(&mut self, addr: u16, mapper: &mut dyn Mapper) -> u8 {
        let value = match addr & 0x2007 {
            0x2002 => {
                let value = (self.status & 0xE0) | (self.open_bus & 0x1F);
                self.status &= !STATUS_VBLANK;
                self.nmi_occurred = false;
                self.write_toggle = false;
                value
            }
            0x2004 => self.oam[self.oam_addr as usize],
            0x2007 => {
                let ppu_addr = self.v & 0x3FFF;
                let value = self.ppu_read(ppu_addr, mapper);
                let result = if ppu_addr >= 0x3F00 {
                    // Palette reads bypass the buffer, which refills from
                    // the nametable underneath the palette window.
                    self.read_buffer = self.ppu_read(ppu_addr - 0x1000, mapper);
                    value
                } else {
                    let buffered = self.read_buffer;
                    self.read_buffer = value;
                    buffered
                };
                self.increment_vram_addr();
                result
            }
            _ => self.open_bus,
        };
        self.open_bus = value;
        value
    }

    pub fn cpu_write_register(&mut self, addr: u16, value: u8, mapper: &mut dyn Mapper) {
        self.open_bus = value;
        match addr & 0x2007 {
            0x2000 => {
                self.ctrl = value;
                self.t = (self.t & !0x0C00) | (((value as u16) & 0x03) << 10);
            }
            0x2001 => self.mask = value,
            0x2003 => self.oam_addr = value,
            0x2004 => {
                self.oam[self.oam_addr as usize] = value;
                self.oam_addr = self.oam_addr.wrapping_add(1);
            }
            0x2005 => {
                if !self.write_toggle {
                    self.fine_x = value & 0x07;
                    self.t = (self.t & !0x001F) | (((value as u16) >> 3) & 0x001F);
                } else {
                    self.t = (self.t & !0x7000) | (((value as u16) & 0x07) << 12);
                    self.t = (self.t & !0x03E0) | ((((value as u16) >> 3) & 0x001F) << 5);
                }
                self.write_toggle = !self.write_toggle;
            }
            0x2006 => {
                if !self.write_toggle {
                    self.t = (self.t & 0x00FF) | (((value as u16) & 0x3F) << 8);
                } else {
                    self.t = (self.t & 0x7F00) | (value as u16);
                    self.v = self.t;
                }
                self.write_toggle = !self.write_toggle;
            }
            0x2007 => {
                self.ppu_write(self.v & 0x3FFF, value, mapper);
                self.increment_vram_addr();
            }
            _ => {}
        }
    }

    /// OAM DMA endpoint: 256 bytes land starting at the current OAMADDR,
    /// wrapping within the 256-byte table. OAMADDR is net unchanged.
    pub fn oam_dma(&mut self, bytes: &[u8; 256]) {
        let start = self.oam_addr;
        for (i, byte) in bytes.iter().enumerate() {
            self.oam[start.wrapping_add(i as u8) as usize] = *byte;
        }
    }

    pub fn tick(&mut self, mapper: &mut dyn Mapper) {
        self.a12_this_dot = false;

        let visible = self.scanline < FRAME_HEIGHT as u16;
        let pre_render = self.scanline == 261;
        let rendering = self.rendering_enabled();

        if pre_render && self.dot == 1 {
            self.status &= !(STATUS_VBLANK | STATUS_SPRITE_ZERO_HIT | STATUS_SPRITE_OVERFLOW);
            self.nmi_occurred = false;
        }
        if self.scanline == 241 && self.dot == 1 {
            self.status |= STATUS_VBLANK;
            self.nmi_occurred = true;
        }

        if visible && (1..=256).contains(&self.dot) {
            self.sample_background_pixel();
        }

        // Tile 0's shifters reload at dot 1 without a coarse-X step.
        if rendering && (visible || pre_render) && self.dot == 1 {
            self.reload_background_shifters();
        }

        let fetch_window = rendering
            && (visible || pre_render)
            && ((1..=256).contains(&self.dot) || (321..=340).contains(&self.dot));
        if fetch_window {
            self.run_fetch_phase(mapper);
        }

        if visible && self.dot == 65 {
            self.sec_oam = [0xFF; 32];
            self.sec_count = 0;
            self.status &= !STATUS_SPRITE_OVERFLOW;
            self.evaluate_sprites();
        }
        if visible && self.dot == 257 {
            self.render_sprites_for_line(mapper);
        }
        if visible && self.dot == 260 {
            mapper.on_scanline_dot260(rendering);
        }

        if rendering && (visible || pre_render) {
            if self.dot == 256 {
                self.increment_y();
            }
            if self.dot == 257 {
                self.copy_horizontal_bits();
            }
            if pre_render && (280..=304).contains(&self.dot) {
                self.copy_vertical_bits();
            }
        }

        // Odd frames drop one dot on the pre-render line while rendering.
        if pre_render && rendering && self.odd_frame && self.dot == 339 {
            mapper.on_ppu_a12(false);
            self.dot = 0;
            self.scanline = 0;
            self.odd_frame = false;
            return;
        }

        self.dot += 1;
        if self.dot > 340 {
            self.dot = 0;
            if visible {
                self.compose_scanline();
            }
            self.scanline += 1;
            if self.scanline > 261 {
                self.scanline = 0;
                self.odd_frame = !self.odd_frame;
            }
        }

        // One A12 sample per dot, after this dot's memory traffic.
        mapper.on_ppu_a12(self.a12_this_dot);
    }

    fn rendering_enabled(&self) -> bool {
        (self.mask & (MASK_SHOW_BG | MASK_SHOW_SPRITES)) != 0
    }

    fn sample_background_pixel(&mut self) {
        let x = (self.dot - 1) as usize;
        let mut bg_pix = 0u8;
        let mut attr = 0u8;

        if (self.mask & MASK_SHOW_BG) != 0 {
            let bit = 15 - self.fine_x;
            let lo = ((self.bg_shift_lo >> bit) & 1) as u8;
            let hi = ((self.bg_shift_hi >> bit) & 1) as u8;
            bg_pix = (hi << 1) | lo;

            let alo = ((self.attr_shift_lo >> bit) & 1) as u8;
            let ahi = ((self.attr_shift_hi >> bit) & 1) as u8;
            attr = (ahi << 1) | alo;

            self.bg_shift_lo <<= 1;
            self.bg_shift_hi <<= 1;
            self.attr_shift_lo <<= 1;
            self.attr_shift_hi <<= 1;

            if (self.mask & MASK_SHOW_BG_LEFT) == 0 && x < 8 {
                bg_pix = 0;
            }
        }

        self.line_bg_pix[x] = bg_pix;
        self.line_bg_color[x] = if bg_pix == 0 {
            self.palette_ram[0] & 0x3F
        } else {
            self.palette_ram[((attr << 2) | bg_pix) as usize] & 0x3F
        };
    }

    fn run_fetch_phase(&mut self, mapper: &mut dyn Mapper) {
        match self.dot % 8 {
            1 => {
                let addr = 0x2000 | (self.v & 0x0FFF);
                self.nt_latch = self.ppu_read(addr, mapper);
            }
            3 => {
                let addr =
                    0x23C0 | (self.v & 0x0C00) | ((self.v >> 4) & 0x0038) | ((self.v >> 2) & 0x0007);
                let at = self.ppu_read(addr, mapper);
                let quadrant = ((self.v >> 5) & 0x02) | ((self.v >> 1) & 0x01);
                self.at_latch = (at >> (quadrant * 2)) & 0x03;
            }
            5 => {
                let addr = self.bg_pattern_addr();
                self.pat_lo_latch = self.ppu_read(addr, mapper);
                if self.dot <= 256 {
                    self.a12_this_dot |= (addr & 0x1000) != 0;
                }
            }
            7 => {
                let addr = self.bg_pattern_addr() + 8;
                self.pat_hi_latch = self.ppu_read(addr, mapper);
                if self.dot <= 256 {
                    self.a12_this_dot |= (addr & 0x1000) != 0;
                }
            }
            0 => {
                self.reload_background_shifters();
                self.increment_coarse_x();
            }
            _ => {}
        }
    }

    fn bg_pattern_addr(&self) -> u16 {
        let fine_y = (self.v >> 12) & 0x07;
        let table = if (self.ctrl & CTRL_BG_TABLE) != 0 {
            0x1000
        } else {
            0x0000
        };
        table + (self.nt_latch as u16) * 16 + fine_y
    }

    fn reload_background_shifters(&mut self) {
        self.bg_shift_lo = (self.bg_shift_lo & 0xFF00) | self.pat_lo_latch as u16;
        self.bg_shift_hi = (self.bg_shift_hi & 0xFF00) | self.pat_hi_latch as u16;

        let lo = if (self.at_latch & 0x01) != 0 { 0xFF } else { 0x00 };
        let hi = if (self.at_latch & 0x02) != 0 { 0xFF } else { 0x00 };
        self.attr_shift_lo = (self.attr_shift_lo & 0xFF00) | lo;
        self.attr_shift_hi = (self.attr_shift_hi & 0xFF00) | hi;
    }

    fn increment_coarse_x(&mut self) {
        if (self.v & 0x001F) == 31 {
            self.v &= !0x001F;
            self.v ^= 0x0400;
        } else {
            self.v += 1;
        }
    }

    fn increment_y(&mut self) {
        if (self.v & 0x7000) != 0x7000 {
            self.v += 0x1000;
            return;
        }

        self.v &= !0x7000;
        let mut y = (self.v & 0x03E0) >> 5;
        if y == 29 {
            y = 0;
            self.v ^= 0x0800;
        } else if y == 31 {
            y = 0;
        } else {
            y += 1;
        }
        self.v = (self.v & !0x03E0) | (y << 5);
    }

    fn copy_horizontal_bits(&mut self) {
        self.v = (self.v & 0x7BE0) | (self.t & 0x041F);
    }

    fn copy_vertical_bits(&mut self) {
        self.v = (self.v & 0x041F) | (self.t & 0x7BE0);
    }

    fn increment_vram_addr(&mut self) {
        let step = if (self.ctrl & CTRL_VRAM_INC_32) != 0 {
            32
        } else {
            1
        };
        self.v = (self.v + step) & 0x7FFF;
    }

    fn sprite_height(&self) -> u16 {
        if (self.ctrl & CTRL_SPRITE_SIZE_16) != 0 {
            16
        } else {
            8
        }
    }

    // Coarse per-line selection: first eight in-range sprites into
    // secondary OAM; a ninth in-range entry sets the overflow flag.
    fn evaluate_sprites(&mut self) {
        let height = self.sprite_height();

        for i in 0..64 {
            let y = self.oam[i * 4] as u16;
            let top = y + 1;
            if self.scanline < top || self.scanline >= top + height {
                continue;
            }
            if self.sec_count == 8 {
                self.status |= STATUS_SPRITE_OVERFLOW;
                break;
            }
            let dst = self.sec_count * 4;
            self.sec_oam[dst..dst + 4].copy_from_slice(&self.oam[i * 4..i * 4 + 4]);
            self.sec_count += 1;
        }
    }

    fn sprite_pattern_addr(&self, tile: u8, row: u16, flip_v: bool) -> u16 {
        if self.sprite_height() == 16 {
            let table = if (tile & 0x01) != 0 { 0x1000 } else { 0x0000 };
            let top_tile = (tile & 0xFE) as u16;
            let r = if flip_v { 15 - row } else { row };
            if r < 8 {
                table + top_tile * 16 + r
            } else {
                table + (top_tile + 1) * 16 + (r - 8)
            }
        } else {
            let table = if (self.ctrl & CTRL_SPRITE_TABLE) != 0 {
                0x1000
            } else {
                0x0000
            };
            let r = if flip_v { 7 - row } else { row };
            table + (tile as u16) * 16 + r
        }
    }

    // Dot 257: fetch the selected sprites' pattern rows and flatten them
    // into X-indexed line buffers. First writer wins each X (OAM order).
    fn render_sprites_for_line(&mut self, mapper: &mut dyn Mapper) {
        self.line_sp_color = [0; FRAME_WIDTH];
        self.line_sp_pix = [0; FRAME_WIDTH];
        self.line_sp_behind = [false; FRAME_WIDTH];
        self.line_sp0_mask = [false; FRAME_WIDTH];

        if (self.mask & MASK_SHOW_SPRITES) == 0 {
            return;
        }

        let height = self.sprite_height();
        let sp_left = (self.mask & MASK_SHOW_SPRITE_LEFT) != 0;

        for s in 0..self.sec_count {
            let y = self.sec_oam[s * 4] as u16;
            let tile = self.sec_oam[s * 4 + 1];
            let attr = self.sec_oam[s * 4 + 2];
            let x = self.sec_oam[s * 4 + 3] as usize;

            let Some(row) = self.scanline.checked_sub(y + 1) else {
                continue;
            };
            if row >= height {
                continue;
            }

            let flip_h = (attr & 0x40) != 0;
            let flip_v = (attr & 0x80) != 0;
            let behind = (attr & 0x20) != 0;
            let palette = attr & 0x03;

            let addr = self.sprite_pattern_addr(tile, row, flip_v);
            let p0 = self.ppu_read(addr, mapper);
            let p1 = self.ppu_read(addr + 8, mapper);

            for c in 0..8usize {
                let sx = x + c;
                if sx >= FRAME_WIDTH {
                    continue;
                }
                if !sp_left && sx < 8 {
                    continue;
                }

                let bit = if flip_h { c } else { 7 - c };
                let lo = (p0 >> bit) & 1;
                let hi = (p1 >> bit) & 1;
                let pix = (hi << 1) | lo;
                if pix == 0 || self.line_sp_pix[sx] != 0 {
                    continue;
                }

                let pal_index = (0x10 | (palette << 2) | pix) as usize;
                self.line_sp_pix[sx] = pix;
                self.line_sp_color[sx] = self.palette_ram[pal_index & 0x1F] & 0x3F;
                self.line_sp_behind[sx] = behind;
                if s == 0 {
                    self.line_sp0_mask[sx] = true;
                }
            }
        }
    }

    fn compose_scanline(&mut self) {
        let y = self.scanline as usize;
        let show_bg = (self.mask & MASK_SHOW_BG) != 0;
        let show_sp = (self.mask & MASK_SHOW_SPRITES) != 0;
        let bg_left = (self.mask & MASK_SHOW_BG_LEFT) != 0;
        let sp_left = (self.mask & MASK_SHOW_SPRITE_LEFT) != 0;
        let universal = self.palette_ram[0] & 0x3F;

        for x in 0..FRAME_WIDTH {
            let bg_masked = !bg_left && x < 8;
            let sp_masked = !sp_left && x < 8;

            let bg_color = if show_bg && !bg_masked {
                self.line_bg_color[x]
            } else {
                universal
            };
            let bg_raw = if show_bg && !bg_masked {
                self.line_bg_pix[x]
            } else {
                0
            };
            let sp_color = if show_sp && !sp_masked {
                self.line_sp_color[x]
            } else {
                0
            };
            let sp_raw = if show_sp && !sp_masked {
                self.line_sp_pix[x]
            } else {
                0
            };

            let out = if sp_raw != 0 && (!self.line_sp_behind[x] || bg_raw == 0) {
                sp_color
            } else {
                bg_color
            };

            let rgb = NES_PALETTE[(out & 0x3F) as usize];
            let idx = (y * FRAME_WIDTH + x) * 4;
            self.frame_buffer[idx] = rgb[0];
            self.frame_buffer[idx + 1] = rgb[1];
            self.frame_buffer[idx + 2] = rgb[2];
            self.frame_buffer[idx + 3] = 0xFF;

            if self.line_sp0_mask[x] && bg_raw != 0 && sp_raw != 0 {
                let bg_left_ok = bg_left || x >= 8;
                let sp_left_ok = sp_left || x >= 8;
                if show_bg && show_sp && bg_left_ok && sp_left_ok {
                    self.status |= STATUS_SPRITE_ZERO_HIT;
                }
            }
        }
    }

    fn ppu_read(&mut self, addr: u16, mapper: &mut dyn Mapper) -> u8 {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => mapper.ppu_read(addr),
            0x2000..=0x3EFF => self.vram[Self::nametable_index(addr, mapper.mirroring())],
            _ => self.palette_ram[Self::palette_index(addr)] & 0x3F,
        }
    }

    fn ppu_write(&mut self, addr: u16, value: u8, mapper: &mut dyn Mapper) {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => mapper.ppu_write(addr, value),
            0x2000..=0x3EFF => {
                self.vram[Self::nametable_index(addr, mapper.mirroring())] = value;
            }
            _ => self.palette_ram[Self::palette_index(addr)] = value,
        }
    }

    // $3F10/$3F14/$3F18/$3F1C mirror their background counterparts.
    fn palette_index(addr: u16) -> usize {
        let mut idx = ((addr - 0x3F00) & 0x1F) as usize;
        if (idx & 0x13) == 0x10 {
            idx &= !0x10;
        }
        idx
    }

    fn nametable_index(addr: u16, mirroring: Mirroring) -> usize {
        let nt = ((addr - 0x2000) & 0x0FFF) as usize;
        let table = nt >> 10;
        let offset = nt & 0x03FF;
        match mirroring {
            Mirroring::Horizontal => ((table & 2) >> 1) * 0x400 + offset,
            Mirroring::Vertical => (table & 1) * 0x400 + offset,
            Mirroring::OneScreenLower => offset,
            Mirroring::OneScreenUpper => 0x400 + offset,
            Mirroring::FourScreen => table * 0x400 + offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Flat 8 KiB CHR-RAM board with fixed mirroring, enough to exercise
    // the PPU in isolation.
    struct FlatBoard {
        chr: Vec<u8>,
        mirroring: Mirroring,
        a12_rises: u32,
        last_a12: bool,
    }

    impl FlatBoard {
        fn new() -> Self {
            Self {
                chr: vec![0; 0x2000],
                mirroring: Mirroring::Horizontal,
                a12_rises: 0,
                last_a12: false,
            }
        }
    }

    impl Mapper for FlatBoard {
        fn cpu_read(&mut self, _addr: u16) -> u8 {
            0
        }
        fn cpu_write(&mut self, _addr: u16, _value: u8) {}
        fn ppu_read(&mut self, addr: u16) -> u8 {
            self.chr[(addr as usize) & 0x1FFF]
        }
        fn ppu_write(&mut self, addr: u16, value: u8) {
            self.chr[(addr as usize) & 0x1FFF] = value;
        }
        fn mirroring(&self) -> Mirroring {
            self.mirroring
        }
        fn on_ppu_a12(&mut self, level: bool) {
            if level && !self.last_a12 {
                self.a12_rises += 1;
            }
            self.last_a12 = level;
        }
    }

    fn write_ppu_addr(ppu: &mut Ppu, board: &mut FlatBoard, addr: u16) {
        ppu.cpu_write_register(0x2006, (addr >> 8) as u8, board);
        ppu.cpu_write_register(0x2006, (addr & 0xFF) as u8, board);
    }

    #[test]
    fn coarse_x_increment_wraps_and_toggles_nametable() {
        let mut ppu = Ppu::new();

        for high_bits in [0x0000u16, 0x7000, 0x0800, 0x03E0] {
            ppu.v = high_bits | 31;
            let before = ppu.v;
            ppu.increment_coarse_x();
            assert_eq!(ppu.v & 0x001F, 0);
            assert_eq!(ppu.v & 0x0400, (before ^ 0x0400) & 0x0400);
            assert_eq!(ppu.v & !0x041F, before & !0x041F);
        }

        ppu.v = 5;
        ppu.increment_coarse_x();
        assert_eq!(ppu.v, 6);
    }

    #[test]
    fn y_increment_steps_fine_y_first() {
        let mut ppu = Ppu::new();
        ppu.v = 0x0000;
        ppu.increment_y();
        assert_eq!(ppu.v, 0x1000);
    }

    #[test]
    fn y_increment_wraps_row_29_into_nametable_flip() {
        let mut ppu = Ppu::new();
        // fine Y = 7, coarse Y = 29.
        ppu.v = 0x7000 | (29 << 5);
        ppu.increment_y();
        assert_eq!((ppu.v >> 12) & 0x07, 0);
        assert_eq!((ppu.v >> 5) & 0x1F, 0);
        assert_eq!(ppu.v & 0x0800, 0x0800);
    }

    #[test]
    fn y_increment_wraps_row_31_without_flip() {
        let mut ppu = Ppu::new();
        ppu.v = 0x7000 | (31 << 5);
        ppu.increment_y();
        assert_eq!((ppu.v >> 5) & 0x1F, 0);
        assert_eq!(ppu.v & 0x0800, 0);
    }

    #[test]
    fn scroll_writes_assemble_t_and_fine_x() {
        let mut ppu = Ppu::new();
        let mut board = FlatBoard::new();

        ppu.cpu_write_register(0x2005, 0x7D, &mut board); // coarse X 15, fine X 5
        assert_eq!(ppu.fine_x, 5);
        assert_eq!(ppu.t & 0x001F, 15);

        ppu.cpu_write_register(0x2005, 0x5E, &mut board); // coarse Y 11, fine Y 6
        assert_eq!((ppu.t >> 5) & 0x1F, 11);
        assert_eq!((ppu.t >> 12) & 0x07, 6);
    }

    #[test]
    fn ppuctrl_write_sets_nametable_bits_of_t() {
        let mut ppu = Ppu::new();
        let mut board = FlatBoard::new();

        ppu.cpu_write_register(0x2000, 0x03, &mut board);
        assert_eq!(ppu.t & 0x0C00, 0x0C00);
    }

    #[test]
    fn ppuaddr_second_write_copies_t_into_v() {
        let mut ppu = Ppu::new();
        let mut board = FlatBoard::new();

        write_ppu_addr(&mut ppu, &mut board, 0x2370);
        assert_eq!(ppu.v, 0x2370);
        // Bit 14 is cleared by the first write.
        write_ppu_addr(&mut ppu, &mut board, 0x7FFF);
        assert_eq!(ppu.v, 0x3FFF);
    }

    #[test]
    fn status_read_clears_vblank_and_write_toggle() {
        let mut ppu = Ppu::new();
        let mut board = FlatBoard::new();

        ppu.status |= STATUS_VBLANK;
        ppu.cpu_write_register(0x2006, 0x21, &mut board);
        assert!(ppu.write_toggle);

        let status = ppu.cpu_read_register(0x2002, &mut board);
        assert_eq!(status & STATUS_VBLANK, STATUS_VBLANK);
        assert_eq!(ppu.status & STATUS_VBLANK, 0);
        assert!(!ppu.write_toggle);
    }

    #[test]
    fn ppudata_reads_are_buffered_by_one() {
        let mut ppu = Ppu::new();
        let mut board = FlatBoard::new();

        write_ppu_addr(&mut ppu, &mut board, 0x2100);
        ppu.cpu_write_register(0x2007, 0x5A, &mut board);

        write_ppu_addr(&mut ppu, &mut board, 0x2100);
        let stale = ppu.cpu_read_register(0x2007, &mut board);
        let fresh = ppu.cpu_read_register(0x2007, &mut board);
        assert_ne!(stale, 0x5A);
        assert_eq!(fresh, 0x5A);
    }

    #[test]
    fn palette_reads_bypass_the_buffer() {
        let mut ppu = Ppu::new();
        let mut board = FlatBoard::new();

        write_ppu_addr(&mut ppu, &mut board, 0x3F01);
        ppu.cpu_write_register(0x2007, 0x2A, &mut board);
        write_ppu_addr(&mut ppu, &mut board, 0x3F01);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut board), 0x2A);
    }

    #[test]
    fn palette_backdrop_mirrors_both_directions() {
        let mut ppu = Ppu::new();
        let mut board = FlatBoard::new();

        for (alias, base) in [(0x3F10, 0x3F00), (0x3F14, 0x3F04), (0x3F18, 0x3F08), (0x3F1C, 0x3F0C)]
        {
            ppu.ppu_write(alias, 0x21, &mut board);
            assert_eq!(ppu.ppu_read(base, &mut board), 0x21);
            ppu.ppu_write(base, 0x12, &mut board);
            assert_eq!(ppu.ppu_read(alias, &mut board), 0x12);
        }
    }

    #[test]
    fn vram_increment_follows_ctrl_bit2() {
        let mut ppu = Ppu::new();
        let mut board = FlatBoard::new();

        write_ppu_addr(&mut ppu, &mut board, 0x2000);
        ppu.cpu_write_register(0x2007, 0x00, &mut board);
        assert_eq!(ppu.v, 0x2001);

        ppu.cpu_write_register(0x2000, CTRL_VRAM_INC_32, &mut board);
        ppu.cpu_write_register(0x2007, 0x00, &mut board);
        assert_eq!(ppu.v, 0x2021);
    }

    #[test]
    fn nametable_mirroring_modes() {
        assert_eq!(
            Ppu::nametable_index(0x2000, Mirroring::Horizontal),
            Ppu::nametable_index(0x2400, Mirroring::Horizontal)
        );
        assert_ne!(
            Ppu::nametable_index(0x2000, Mirroring::Horizontal),
            Ppu::nametable_index(0x2800, Mirroring::Horizontal)
        );
        assert_eq!(
            Ppu::nametable_index(0x2000, Mirroring::Vertical),
            Ppu::nametable_index(0x2800, Mirroring::Vertical)
        );
        assert_ne!(
            Ppu::nametable_index(0x2000, Mirroring::Vertical),
            Ppu::nametable_index(0x2400, Mirroring::Vertical)
        );
        assert_eq!(Ppu::nametable_index(0x2C13, Mirroring::OneScreenLower), 0x13);
        assert_eq!(
            Ppu::nametable_index(0x2C13, Mirroring::FourScreen),
            3 * 0x400 + 0x13
        );
    }

    #[test]
    fn oam_dma_honours_oamaddr_rotation() {
        let mut ppu = Ppu::new();
        let mut bytes = [0u8; 256];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }

        ppu.oam_addr = 0x10;
        ppu.oam_dma(&bytes);
        for (i, b) in bytes.iter().enumerate() {
            assert_eq!(ppu.oam[(0x10 + i) & 0xFF], *b);
        }
        assert_eq!(ppu.oam_addr, 0x10);
    }

    #[test]
    fn vblank_sets_and_clears_on_schedule() {
        let mut ppu = Ppu::new();
        let mut board = FlatBoard::new();

        ppu.scanline = 241;
        ppu.dot = 1;
        ppu.tick(&mut board);
        assert_eq!(ppu.status & STATUS_VBLANK, STATUS_VBLANK);
        assert!(ppu.nmi_occurred);

        ppu.scanline = 261;
        ppu.dot = 1;
        ppu.tick(&mut board);
        assert_eq!(ppu.status & STATUS_VBLANK, 0);
        assert!(!ppu.nmi_occurred);
    }

    #[test]
    fn odd_frame_skips_dot_339_when_rendering() {
        let mut ppu = Ppu::new();
        let mut board = FlatBoard::new();
        ppu.mask = MASK_SHOW_BG;

        ppu.scanline = 261;
        ppu.dot = 339;
        ppu.odd_frame = true;
        ppu.tick(&mut board);
        assert_eq!((ppu.scanline, ppu.dot), (0, 0));

        // Even frames keep the full line.
        ppu.scanline = 261;
        ppu.dot = 339;
        ppu.tick(&mut board);
        assert_eq!((ppu.scanline, ppu.dot), (261, 340));
    }

    #[test]
    fn background_fetches_publish_a12_rises() {
        let mut ppu = Ppu::new();
        let mut board = FlatBoard::new();
        // BG table at $1000: every pattern fetch drives A12 high.
        ppu.mask = MASK_SHOW_BG;
        ppu.ctrl = CTRL_BG_TABLE;
        ppu.scanline = 0;
        ppu.dot = 0;

        for _ in 0..341 {
            ppu.tick(&mut board);
        }
        // One filtered-out rise per tile: 32 tiles across dots 1-256.
        assert!(board.a12_rises >= 32);
    }

    #[test]
    fn sprite_zero_hit_on_opaque_overlap() {
        let mut ppu = Ppu::new();
        let mut board = FlatBoard::new();
        // Solid tile 0: BG and sprite pixels are all opaque.
        board.chr.fill(0xFF);
        ppu.vram.fill(0);
        ppu.oam = [0xFF; 256];
        ppu.oam[0] = 10; // sprite 0 on lines 11..=18
        ppu.oam[1] = 0;
        ppu.oam[2] = 0;
        ppu.oam[3] = 20;
        ppu.mask = MASK_SHOW_BG | MASK_SHOW_SPRITES | MASK_SHOW_BG_LEFT | MASK_SHOW_SPRITE_LEFT;

        ppu.scanline = 0;
        ppu.dot = 0;
        while ppu.scanline < 12 {
            ppu.tick(&mut board);
        }
        assert_eq!(ppu.status & STATUS_SPRITE_ZERO_HIT, STATUS_SPRITE_ZERO_HIT);
    }

    #[test]
    fn sprite_overflow_on_ninth_in_range_sprite() {
        let mut ppu = Ppu::new();
        let mut board = FlatBoard::new();
        ppu.oam = [0xFF; 256];
        for i in 0..9 {
            ppu.oam[i * 4] = 40;
            ppu.oam[i * 4 + 3] = (i * 8) as u8;
        }
        ppu.mask = MASK_SHOW_BG | MASK_SHOW_SPRITES;

        ppu.scanline = 41;
        ppu.dot = 65;
        ppu.tick(&mut board);
        assert_eq!(ppu.status & STATUS_SPRITE_OVERFLOW, STATUS_SPRITE_OVERFLOW);
        assert_eq!(ppu.sec_count, 8);
    }

    #[test]
    fn eight_sprites_do_not_set_overflow() {
        let mut ppu = Ppu::new();
        let mut board = FlatBoard::new();
        ppu.oam = [0xFF; 256];
        for i in 0..8 {
            ppu.oam[i * 4] = 40;
        }
        ppu.mask = MASK_SHOW_BG | MASK_SHOW_SPRITES;

        ppu.scanline = 41;
        ppu.dot = 65;
        ppu.tick(&mut board);
        assert_eq!(ppu.status & STATUS_SPRITE_OVERFLOW, 0);
    }

    #[test]
    fn front_sprite_wins_over_background() {
        let mut ppu = Ppu::new();
        let mut board = FlatBoard::new();
        board.chr.fill(0xFF);
        ppu.oam = [0xFF; 256];
        ppu.oam[0] = 10;
        ppu.oam[1] = 0;
        ppu.oam[2] = 0x00; // in front, palette 0
        ppu.oam[3] = 100;
        ppu.mask = MASK_SHOW_BG | MASK_SHOW_SPRITES | MASK_SHOW_BG_LEFT | MASK_SHOW_SPRITE_LEFT;

        // Sprite palette entry $3F13 and BG entry $3F03 get distinct colors.
        ppu.palette_ram[0x13] = 0x15;
        ppu.palette_ram[0x03] = 0x2A;

        ppu.scanline = 0;
        ppu.dot = 0;
        while ppu.scanline < 12 {
            ppu.tick(&mut board);
        }

        let sprite_px = (11 * FRAME_WIDTH + 100) * 4;
        let bg_px = (11 * FRAME_WIDTH + 50) * 4;
        assert_eq!(ppu.frame_buffer[sprite_px], NES_PALETTE[0x15][0]);
        assert_eq!(ppu.frame_buffer[bg_px], NES_PALETTE[0x2A][0]);
    }
}
