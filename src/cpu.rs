//! 6502 (2A03) executor: decode/execute, interrupt arbitration with the
//! one-instruction IRQ inhibit delay, and the OAM DMA stall.

use crate::{
    Nes, FLAG_BREAK, FLAG_CARRY, FLAG_DECIMAL, FLAG_INTERRUPT, FLAG_NEGATIVE, FLAG_OVERFLOW,
    FLAG_UNUSED, FLAG_ZERO,
};

impl Nes {
    /// Execute one instruction, or burn one stalled DMA cycle. Returns
    /// the CPU cycles consumed.
    pub(crate) fn step_cpu(&mut self) -> u32 {
        if self.dma_stall_cycles > 0 {
            self.dma_stall_cycles -= 1;
            self.cycles += 1;
            return 1;
        }

        // CLI/SEI/PLP/RTI delay the new I value by one boundary: the
        // level lines are not re-sampled on the boundary right after.
        let suppress_irq = self.irq_delay != 0;
        self.irq_delay = 0;

        if !suppress_irq
            && !self.get_flag(FLAG_INTERRUPT)
            && (self.mapper_irq() || self.apu.irq_line())
        {
            self.pending_irq = true;
        }

        if self.pending_nmi {
            self.pending_nmi = false;
            self.service_interrupt(0xFFFA);
            self.cycles += 7;
            return 7;
        }

        if self.pending_irq && !self.get_flag(FLAG_INTERRUPT) {
            self.pending_irq = false;
            self.service_interrupt(0xFFFE);
            self.mapper_irq_ack();
            self.cycles += 7;
            return 7;
        }

        let opcode = self.fetch_byte();
        let cycles = self.exec_opcode(opcode);
        self.cycles += cycles as u64;
        cycles
    }

    fn service_interrupt(&mut self, vector: u16) {
        self.push_u16(self.pc);
        self.push((self.p & !FLAG_BREAK) | FLAG_UNUSED);
        self.set_flag(FLAG_INTERRUPT, true);
        self.pc = self.read_u16(vector);
    }

    fn exec_opcode(&mut self, opcode: u8) -> u32 {
        // Single-byte register ops live across the decode groups; handle
        // them up front.
        match opcode {
            0x8A => {
                self.a = self.x;
                self.update_zn(self.a);
                return 2;
            }
            0x9A => {
                self.sp = self.x;
                return 2;
            }
            0xAA => {
                self.x = self.a;
                self.update_zn(self.x);
                return 2;
            }
            0xBA => {
                self.x = self.sp;
                self.update_zn(self.x);
                return 2;
            }
            0xCA => {
                self.x = self.x.wrapping_sub(1);
                self.update_zn(self.x);
                return 2;
            }
            0xEA => return 2,
            // Unofficial immediate NOPs still fetch their operand.
            0x80 | 0x82 | 0x89 | 0xC2 | 0xE2 => {
                self.fetch_byte();
                return 2;
            }
            // Unofficial SBC immediate, alias of $E9.
            0xEB => {
                let value = self.fetch_byte();
                self.sbc(value);
                return 2;
            }
            _ => {}
        }

        match opcode & 0x03 {
            0x01 => self.exec_group1(opcode),
            0x02 => self.exec_group2(opcode),
            0x03 => 2, // unofficial RMW combos are out of scope
            _ => self.exec_group0(opcode),
        }
    }

    // cc == 01: the eight ALU operations across the full addressing grid.
    fn exec_group1(&mut self, opcode: u8) -> u32 {
        let aaa = opcode >> 5;
        let bbb = (opcode >> 2) & 0x07;
        let is_store = aaa == 4;

        if bbb == 2 {
            if is_store {
                return 2; // STA #imm has no meaning
            }
            let value = self.fetch_byte();
            self.exec_group1_alu(aaa, value);
            return 2;
        }

        let (addr, page_crossed, base_cycles) = match bbb {
            0 => (self.addr_indx(), false, 6),
            1 => (self.addr_zp(), false, 3),
            3 => (self.addr_abs(), false, 4),
            4 => {
                let (addr, crossed) = self.addr_indy();
                (addr, crossed, 5)
            }
            5 => (self.addr_zpx(), false, 4),
            6 => {
                let (addr, crossed) = self.addr_absy();
                (addr, crossed, 4)
            }
            _ => {
                let (addr, crossed) = self.addr_absx();
                (addr, crossed, 4)
            }
        };

        if is_store {
            self.cpu_write(addr, self.a);
            // Indexed stores always pay the fix-up cycle.
            return match bbb {
                4 => 6,
                6 | 7 => 5,
                _ => base_cycles,
            };
        }

        let value = self.cpu_read(addr);
        self.exec_group1_alu(aaa, value);
        base_cycles + (page_crossed && matches!(bbb, 4 | 6 | 7)) as u32
    }

    fn exec_group1_alu(&mut self, aaa: u8, value: u8) {
        match aaa {
            0 => {
                self.a |= value;
                self.update_zn(self.a);
            }
            1 => {
                self.a &= value;
                self.update_zn(self.a);
            }
            2 => {
                self.a ^= value;
                self.update_zn(self.a);
            }
            3 => self.adc(value),
            5 => {
                self.a = value;
                self.update_zn(self.a);
            }
            6 => self.compare(self.a, value),
            7 => self.sbc(value),
            _ => {}
        }
    }

    // cc == 10: shifts/rotates, INC/DEC, and the X-register column.
    fn exec_group2(&mut self, opcode: u8) -> u32 {
        let aaa = opcode >> 5;
        let bbb = (opcode >> 2) & 0x07;
        match aaa {
            0 => self.exec_rmw(bbb, RmwOp::Asl),
            1 => self.exec_rmw(bbb, RmwOp::Rol),
            2 => self.exec_rmw(bbb, RmwOp::Lsr),
            3 => self.exec_rmw(bbb, RmwOp::Ror),
            4 => self.exec_stx(bbb),
            5 => self.exec_ldx(bbb),
            6 => self.exec_rmw(bbb, RmwOp::Dec),
            _ => self.exec_rmw(bbb, RmwOp::Inc),
        }
    }

    fn exec_stx(&mut self, bbb: u8) -> u32 {
        match bbb {
            1 => {
                let addr = self.addr_zp();
                self.cpu_write(addr, self.x);
                3
            }
            3 => {
                let addr = self.addr_abs();
                self.cpu_write(addr, self.x);
                4
            }
            5 => {
                let addr = self.addr_zpy();
                self.cpu_write(addr, self.x);
                4
            }
            _ => 2,
        }
    }

    fn exec_ldx(&mut self, bbb: u8) -> u32 {
        match bbb {
            0 => {
                self.x = self.fetch_byte();
                self.update_zn(self.x);
                2
            }
            1 => {
                let addr = self.addr_zp();
                self.x = self.cpu_read(addr);
                self.update_zn(self.x);
                3
            }
            3 => {
                let addr = self.addr_abs();
                self.x = self.cpu_read(addr);
                self.update_zn(self.x);
                4
            }
            5 => {
                let addr = self.addr_zpy();
                self.x = self.cpu_read(addr);
                self.update_zn(self.x);
                4
            }
            7 => {
                // LDX abs,Y
                let (addr, crossed) = self.addr_absy();
                self.x = self.cpu_read(addr);
                self.update_zn(self.x);
                4 + crossed as u32
            }
            _ => 2,
        }
    }

    fn exec_rmw(&mut self, bbb: u8, op: RmwOp) -> u32 {
        if bbb == 2 {
            // Accumulator form; INC/DEC have no accumulator variant.
            if matches!(op, RmwOp::Dec | RmwOp::Inc) {
                return 2;
            }
            self.a = self.apply_rmw(op, self.a);
            return 2;
        }

        let (addr, cycles) = match bbb {
            1 => (self.addr_zp(), 5),
            3 => (self.addr_abs(), 6),
            5 => (self.addr_zpx(), 6),
            7 => (self.addr_absx().0, 7),
            _ => return 2,
        };

        let value = self.cpu_read(addr);
        let out = self.apply_rmw(op, value);
        self.cpu_write(addr, out);
        cycles
    }

    fn apply_rmw(&mut self, op: RmwOp, value: u8) -> u8 {
        match op {
            RmwOp::Asl => self.asl(value),
            RmwOp::Rol => self.rol(value),
            RmwOp::Lsr => self.lsr(value),
            RmwOp::Ror => self.ror(value),
            RmwOp::Dec => {
                let out = value.wrapping_sub(1);
                self.update_zn(out);
                out
            }
            RmwOp::Inc => {
                let out = value.wrapping_add(1);
                self.update_zn(out);
                out
            }
        }
    }

    // Everything else: branches, jumps, stack, flags, Y-register column,
    // and the documented unofficial NOPs.
    fn exec_group0(&mut self, opcode: u8) -> u32 {
        match opcode {
            0x00 => {
                // BRK pushes PC+1 and P with B set.
                self.pc = self.pc.wrapping_add(1);
                self.push_u16(self.pc);
                self.push(self.p | FLAG_BREAK | FLAG_UNUSED);
                self.set_flag(FLAG_INTERRUPT, true);
                self.pc = self.read_u16(0xFFFE);
                7
            }
            0x08 => {
                self.push(self.p | FLAG_BREAK | FLAG_UNUSED);
                3
            }
            0x10 => self.branch(!self.get_flag(FLAG_NEGATIVE)),
            0x18 => {
                self.set_flag(FLAG_CARRY, false);
                2
            }
            0x20 => {
                let addr = self.fetch_word();
                self.push_u16(self.pc.wrapping_sub(1));
                self.pc = addr;
                6
            }
            0x24 => {
                let addr = self.addr_zp();
                let value = self.cpu_read(addr);
                self.bit(value);
                3
            }
            0x28 => {
                self.p = (self.pop() & !FLAG_BREAK) | FLAG_UNUSED;
                self.irq_delay = 1;
                4
            }
            0x2C => {
                let addr = self.addr_abs();
                let value = self.cpu_read(addr);
                self.bit(value);
                4
            }
            0x30 => self.branch(self.get_flag(FLAG_NEGATIVE)),
            0x38 => {
                self.set_flag(FLAG_CARRY, true);
                2
            }
            0x40 => {
                // RTI
                self.p = (self.pop() & !FLAG_BREAK) | FLAG_UNUSED;
                self.pc = self.pop_u16();
                self.irq_delay = 1;
                6
            }
            0x48 => {
                self.push(self.a);
                3
            }
            0x4C => {
                self.pc = self.fetch_word();
                3
            }
            0x50 => self.branch(!self.get_flag(FLAG_OVERFLOW)),
            0x58 => {
                self.set_flag(FLAG_INTERRUPT, false);
                self.irq_delay = 1;
                2
            }
            0x60 => {
                self.pc = self.pop_u16().wrapping_add(1);
                6
            }
            0x68 => {
                self.a = self.pop();
                self.update_zn(self.a);
                4
            }
            0x6C => {
                // JMP (indirect) never carries into the high pointer byte.
                let ptr = self.fetch_word();
                self.pc = self.read_u16_bug(ptr);
                5
            }
            0x70 => self.branch(self.get_flag(FLAG_OVERFLOW)),
            0x78 => {
                self.set_flag(FLAG_INTERRUPT, true);
                self.irq_delay = 1;
                2
            }
            0x84 => {
                let addr = self.addr_zp();
                self.cpu_write(addr, self.y);
                3
            }
            0x88 => {
                self.y = self.y.wrapping_sub(1);
                self.update_zn(self.y);
                2
            }
            0x8C => {
                let addr = self.addr_abs();
                self.cpu_write(addr, self.y);
                4
            }
            0x90 => self.branch(!self.get_flag(FLAG_CARRY)),
            0x94 => {
                let addr = self.addr_zpx();
                self.cpu_write(addr, self.y);
                4
            }
            0x98 => {
                self.a = self.y;
                self.update_zn(self.a);
                2
            }
            0xA0 => {
                self.y = self.fetch_byte();
                self.update_zn(self.y);
                2
            }
            0xA4 => {
                let addr = self.addr_zp();
                self.y = self.cpu_read(addr);
                self.update_zn(self.y);
                3
            }
            0xA8 => {
                self.y = self.a;
                self.update_zn(self.y);
                2
            }
            0xAC => {
                let addr = self.addr_abs();
                self.y = self.cpu_read(addr);
                self.update_zn(self.y);
                4
            }
            0xB0 => self.branch(self.get_flag(FLAG_CARRY)),
            0xB4 => {
                let addr = self.addr_zpx();
                self.y = self.cpu_read(addr);
                self.update_zn(self.y);
                4
            }
            0xB8 => {
                self.set_flag(FLAG_OVERFLOW, false);
                2
            }
            0xBC => {
                // LDY abs,X
                let (addr, crossed) = self.addr_absx();
                self.y = self.cpu_read(addr);
                self.update_zn(self.y);
                4 + crossed as u32
            }
            0xC0 => {
                let value = self.fetch_byte();
                self.compare(self.y, value);
                2
            }
            0xC4 => {
                let addr = self.addr_zp();
                let value = self.cpu_read(addr);
                self.compare(self.y, value);
                3
            }
            0xC8 => {
                self.y = self.y.wrapping_add(1);
                self.update_zn(self.y);
                2
            }
            0xCC => {
                let addr = self.addr_abs();
                let value = self.cpu_read(addr);
                self.compare(self.y, value);
                4
            }
            0xD0 => self.branch(!self.get_flag(FLAG_ZERO)),
            0xD8 => {
                // Decimal mode is inert on the 2A03; the flag still latches.
                self.set_flag(FLAG_DECIMAL, false);
                2
            }
            0xE0 => {
                let value = self.fetch_byte();
                self.compare(self.x, value);
                2
            }
            0xE4 => {
                let addr = self.addr_zp();
                let value = self.cpu_read(addr);
                self.compare(self.x, value);
                3
            }
            0xE8 => {
                self.x = self.x.wrapping_add(1);
                self.update_zn(self.x);
                2
            }
            0xEC => {
                let addr = self.addr_abs();
                let value = self.cpu_read(addr);
                self.compare(self.x, value);
                4
            }
            0xF0 => self.branch(self.get_flag(FLAG_ZERO)),
            0xF8 => {
                self.set_flag(FLAG_DECIMAL, true);
                2
            }

            // Documented unofficial NOPs with real operand fetches.
            0x04 | 0x44 | 0x64 => {
                let addr = self.addr_zp();
                let _ = self.cpu_read(addr);
                3
            }
            0x14 | 0x34 | 0x54 | 0x74 | 0xD4 | 0xF4 => {
                let addr = self.addr_zpx();
                let _ = self.cpu_read(addr);
                4
            }
            0x0C => {
                let addr = self.addr_abs();
                let _ = self.cpu_read(addr);
                4
            }
            0x1C | 0x3C | 0x5C | 0x7C | 0xDC | 0xFC => {
                let (addr, crossed) = self.addr_absx();
                let _ = self.cpu_read(addr);
                4 + crossed as u32
            }

            // Anything unrecognized degrades to a two-cycle NOP.
            _ => 2,
        }
    }

    fn addr_zp(&mut self) -> u16 {
        self.fetch_byte() as u16
    }

    fn addr_zpx(&mut self) -> u16 {
        self.fetch_byte().wrapping_add(self.x) as u16
    }

    fn addr_zpy(&mut self) -> u16 {
        self.fetch_byte().wrapping_add(self.y) as u16
    }

    fn addr_abs(&mut self) -> u16 {
        self.fetch_word()
    }

    fn addr_absx(&mut self) -> (u16, bool) {
        let base = self.fetch_word();
        let addr = base.wrapping_add(self.x as u16);
        (addr, (base & 0xFF00) != (addr & 0xFF00))
    }

    fn addr_absy(&mut self) -> (u16, bool) {
        let base = self.fetch_word();
        let addr = base.wrapping_add(self.y as u16);
        (addr, (base & 0xFF00) != (addr & 0xFF00))
    }

    fn addr_indx(&mut self) -> u16 {
        let zp = self.fetch_byte().wrapping_add(self.x);
        self.read_zp_u16(zp)
    }

    fn addr_indy(&mut self) -> (u16, bool) {
        let zp = self.fetch_byte();
        let base = self.read_zp_u16(zp);
        let addr = base.wrapping_add(self.y as u16);
        (addr, (base & 0xFF00) != (addr & 0xFF00))
    }

    // Zero-page pointer reads wrap within the page.
    fn read_zp_u16(&mut self, addr: u8) -> u16 {
        let lo = self.cpu_read(addr as u16) as u16;
        let hi = self.cpu_read(addr.wrapping_add(1) as u16) as u16;
        (hi << 8) | lo
    }

    fn branch(&mut self, condition: bool) -> u32 {
        let offset = self.fetch_byte() as i8;
        if !condition {
            return 2;
        }
        let old_pc = self.pc;
        self.pc = self.pc.wrapping_add(offset as i16 as u16);
        if (old_pc & 0xFF00) != (self.pc & 0xFF00) {
            4
        } else {
            3
        }
    }

    fn bit(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, (self.a & value) == 0);
        self.set_flag(FLAG_OVERFLOW, (value & 0x40) != 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
    }

    fn compare(&mut self, register: u8, value: u8) {
        self.set_flag(FLAG_CARRY, register >= value);
        self.update_zn(register.wrapping_sub(value));
    }

    fn adc(&mut self, value: u8) {
        let carry_in = self.get_flag(FLAG_CARRY) as u16;
        let sum = self.a as u16 + value as u16 + carry_in;
        let result = sum as u8;

        self.set_flag(FLAG_CARRY, sum > 0xFF);
        self.set_flag(
            FLAG_OVERFLOW,
            (!(self.a ^ value) & (self.a ^ result) & 0x80) != 0,
        );
        self.a = result;
        self.update_zn(self.a);
    }

    fn sbc(&mut self, value: u8) {
        self.adc(value ^ 0xFF);
    }

    fn asl(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
        let result = value << 1;
        self.update_zn(result);
        result
    }

    fn lsr(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
        let result = value >> 1;
        self.update_zn(result);
        result
    }

    fn rol(&mut self, value: u8) -> u8 {
        let carry_in = self.get_flag(FLAG_CARRY) as u8;
        self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
        let result = (value << 1) | carry_in;
        self.update_zn(result);
        result
    }

    fn ror(&mut self, value: u8) -> u8 {
        let carry_in = (self.get_flag(FLAG_CARRY) as u8) << 7;
        self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
        let result = (value >> 1) | carry_in;
        self.update_zn(result);
        result
    }
}

#[derive(Clone, Copy)]
enum RmwOp {
    Asl,
    Rol,
    Lsr,
    Ror,
    Dec,
    Inc,
}
