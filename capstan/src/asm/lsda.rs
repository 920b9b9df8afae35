//! `.gcc_except_table` emission (the LSDA consumed by the Itanium C++
//! personality routine).
//!
//! Per function, the lowering layer reports call sites with landing pads
//! and their actions; `except_encode_func` serializes the language-specific
//! data area: a ULEB call-site table covering the whole function (gaps are
//! padded with action 0 entries), the action chain records, the type-info
//! pointer table (reversed, PC-relative indirect) and the exception-spec
//! table. Action index 0 is the pre-wired cleanup action.

use super::{uleb_len, write_sleb, write_uleb, Assembler, Label, SymRef};
use gimli::constants as dw;

/// One call site with a landing pad.
#[derive(Clone, Copy, Debug)]
pub struct CallSiteInfo {
    /// Start of the covered range, as a text-section offset.
    pub start: u32,
    /// Length of the covered range in bytes.
    pub len: u32,
    pub landing_pad: Label,
    /// 1-based offset into the action table; 0 means cleanup.
    pub action_entry: u32,
}

impl Assembler {
    /// Reset the exception tables for a new function.
    pub fn except_begin_func(&mut self) {
        self.except_call_sites.clear();
        self.except_action_table.clear();
        self.except_type_info_table.clear();
        self.except_spec_table.clear();
        // Slot for the cleanup action chain (action record 0).
        self.except_action_table.resize(2, 0);
    }

    /// Record a call site covering `[text_off, text_off + len)` landing at
    /// `landing_pad`. `is_cleanup` call sites use the shared cleanup action;
    /// otherwise the actions added after this call apply.
    pub fn except_add_call_site(
        &mut self,
        text_off: u32,
        len: u32,
        landing_pad: Label,
        is_cleanup: bool,
    ) {
        let action_entry = if is_cleanup {
            0
        } else {
            self.except_action_table.len() as u32 + 1
        };
        self.except_call_sites.push(CallSiteInfo {
            start: text_off,
            len,
            landing_pad,
            action_entry,
        });
    }

    /// Terminate the current call site's action chain with a cleanup.
    pub fn except_add_cleanup_action(&mut self) {
        self.except_action_table.pop();
        let off = -(self.except_action_table.len() as i64);
        write_sleb(&mut self.except_action_table, off);
    }

    /// Append a catch action for `type_sym` (or catch-all when `None`).
    /// `first_action` distinguishes the head of a call site's chain.
    pub fn except_add_action(&mut self, first_action: bool, type_sym: Option<SymRef>) {
        if !first_action {
            *self.except_action_table.last_mut().unwrap() = 1;
        }

        let mut idx = 0u64;
        if let Some(sym) = type_sym {
            let mut found = false;
            for &existing in &self.except_type_info_table {
                idx += 1;
                if existing == sym {
                    found = true;
                    break;
                }
            }
            if !found {
                idx += 1;
                self.except_type_info_table.push(sym);
            }
        }

        write_sleb(&mut self.except_action_table, idx as i64 + 1);
        self.except_action_table.push(0);
    }

    /// Append an empty exception-specification (filter) action.
    pub fn except_add_empty_spec_action(&mut self, first_action: bool) {
        if !first_action {
            *self.except_action_table.last_mut().unwrap() = 1;
        }
        if self.except_spec_table.is_empty() {
            self.except_spec_table.resize(4, 0);
        }
        self.except_action_table.push(0x7f); // SLEB128 -1
        self.except_action_table.push(0);
    }

    /// The `ttypeIndex` the personality routine will see for `sym`.
    pub fn except_type_idx_for_sym(&self, sym: SymRef) -> u64 {
        // Index 0 is the cleanup action and index 1 the catch-all null
        // entry, so real type infos start at 2.
        let mut idx = 2;
        for &existing in &self.except_type_info_table {
            if existing == sym {
                return idx;
            }
            idx += 1;
        }
        unreachable!("type info symbol was never added");
    }

    /// Serialize the function's LSDA into `.gcc_except_table`.
    pub fn except_encode_func(&mut self, func_sym: SymRef) {
        if self.cur_personality.is_none() {
            debug_assert!(self.except_call_sites.is_empty());
            debug_assert!(self.except_type_info_table.is_empty());
            debug_assert!(self.except_spec_table.is_empty());
            return;
        }

        // Encode the call sites first; the header needs their total size.
        let fn_start = self.sym_value(func_sym);
        let fn_end = fn_start + self.symbol(func_sym).size;
        let mut encoded = core::mem::take(&mut self.except_encoded_call_sites);
        encoded.clear();
        let mut cur = fn_start;
        let call_sites = core::mem::take(&mut self.except_call_sites);
        for info in &call_sites {
            let start = info.start as u64;
            if start > cur {
                // Pad the uncovered range; action 0, no landing pad.
                write_uleb(&mut encoded, cur - fn_start);
                write_uleb(&mut encoded, start - cur);
                write_uleb(&mut encoded, 0);
                write_uleb(&mut encoded, 0);
            }
            write_uleb(&mut encoded, start - fn_start);
            write_uleb(&mut encoded, info.len as u64);
            let pad_off = self.label_offset(info.landing_pad) as u64 - fn_start;
            debug_assert!(pad_off < fn_end - fn_start);
            write_uleb(&mut encoded, pad_off);
            write_uleb(&mut encoded, info.action_entry as u64);
            cur = start + info.len as u64;
        }
        if cur < fn_end {
            write_uleb(&mut encoded, cur - fn_start);
            write_uleb(&mut encoded, fn_end - cur);
            write_uleb(&mut encoded, 0);
            write_uleb(&mut encoded, 0);
        }
        self.except_call_sites = call_sites;

        // Only the pre-wired two-byte cleanup slot and no type infos means
        // no call site can reference a real action chain.
        let have_actions =
            self.except_action_table.len() > 2 || !self.except_type_info_table.is_empty();
        let type_count = self.except_type_info_table.len();
        let action_len = self.except_action_table.len();
        let spec = core::mem::take(&mut self.except_spec_table);
        let actions = self.except_action_table.clone();
        let type_syms = self.except_type_info_table.clone();

        let et_sec = self.except_table_section();
        let pc32 = self.target.reloc_pc32;
        let out = &mut self.sections[et_sec].data;

        out.push(dw::DW_EH_PE_omit.0); // lpStartEncoding
        if !have_actions {
            debug_assert_eq!(type_count, 0);
            out.push(dw::DW_EH_PE_omit.0); // ttypeEncoding
        } else {
            out.push(dw::DW_EH_PE_sdata4.0 | dw::DW_EH_PE_pcrel.0 | dw::DW_EH_PE_indirect.0);
            // Offset from after this ULEB to the end of the type table.
            let mut class_info_off = (type_count as u64 + 1) * 4;
            class_info_off += action_len as u64;
            class_info_off += encoded.len() as u64 + uleb_len(encoded.len() as u64) as u64 + 1;
            write_uleb(out, class_info_off);
        }

        out.push(dw::DW_EH_PE_uleb128.0); // callSiteEncoding
        write_uleb(out, encoded.len() as u64);
        out.extend_from_slice(&encoded);
        out.extend_from_slice(&actions);

        if have_actions {
            // Type-info table, reversed: entry -1 sits immediately before
            // the class-info point, -2 before that, and so on; the final
            // slot is the null catch-all entry.
            out.resize(out.len() + (type_count + 1) * 4, 0);
            let mut off = out.len() as u64 - 8;
            let mut relocs = Vec::with_capacity(type_count);
            for &sym in &type_syms {
                relocs.push((sym, off));
                off -= 4;
            }
            out.extend_from_slice(&spec);
            for (sym, off) in relocs {
                self.reloc(et_sec, sym, pc32, off, 0);
            }
        }

        self.except_encoded_call_sites = encoded;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::SymBinding;
    use crate::isa::x64::X64;
    use crate::Machine;

    fn func_with_body(a: &mut Assembler, len: usize) -> SymRef {
        let f = a.sym_predef_func("f", SymBinding::Global);
        a.put(&vec![0x90; len]);
        a.sym_def(f, a.text_section(), 0, len as u64);
        f
    }

    #[test]
    fn no_personality_no_lsda() {
        let mut a = Assembler::new(X64::target_info());
        let f = func_with_body(&mut a, 8);
        a.except_begin_func();
        let fde = a.eh_begin_fde(None);
        a.eh_end_fde(fde, f);
        a.except_encode_func(f);
        assert!(a.secref_except_table.is_none());
    }

    #[test]
    fn cleanup_call_site_encodes_action_zero() {
        let mut a = Assembler::new(X64::target_info());
        let pers = a.sym_add_undef("pers", SymBinding::Global);
        a.except_begin_func();
        a.put(&[0x90; 32]);
        let pad = a.label_create();
        a.label_place(pad); // landing pad at offset 32
        a.put(&[0x90; 8]);
        let f = a.sym_predef_func("f", SymBinding::Global);
        a.sym_def(f, a.text_section(), 0, 40);
        a.except_add_call_site(8, 5, pad, true);
        let fde = a.eh_begin_fde(Some(pers));
        a.eh_end_fde(fde, f);
        a.except_encode_func(f);

        let et = a.secref_except_table.expand().unwrap();
        let data = &a.section(et).data;
        // Header: lpStart=omit, ttype=omit (no actions), callsite=uleb128.
        assert_eq!(data[0], dw::DW_EH_PE_omit.0);
        assert_eq!(data[1], dw::DW_EH_PE_omit.0);
        assert_eq!(data[2], dw::DW_EH_PE_uleb128.0);
        // Entries: pad [0,8), site [8,13) -> landing 32 action 0,
        // pad [13,40).
        let mut expect = Vec::new();
        for chunk in [[0u64, 8, 0, 0], [8, 5, 32, 0], [13, 27, 0, 0]] {
            for v in chunk {
                write_uleb(&mut expect, v);
            }
        }
        assert_eq!(data[3], expect.len() as u8);
        assert_eq!(&data[4..4 + expect.len()], &expect[..]);
    }

    #[test]
    fn catch_actions_build_type_table() {
        let mut a = Assembler::new(X64::target_info());
        let pers = a.sym_add_undef("pers", SymBinding::Global);
        let ti = a.sym_add_undef("typeinfo_for_X", SymBinding::Global);
        a.except_begin_func();
        a.put(&[0x90; 16]);
        let pad = a.label_create();
        a.label_place(pad);
        a.put(&[0x90]);
        let f = a.sym_predef_func("f", SymBinding::Global);
        a.sym_def(f, a.text_section(), 0, 17);
        a.except_add_call_site(0, 4, pad, false);
        a.except_add_action(true, Some(ti));
        assert_eq!(a.except_type_idx_for_sym(ti), 2);

        let fde = a.eh_begin_fde(Some(pers));
        a.eh_end_fde(fde, f);
        a.except_encode_func(f);

        let et = a.secref_except_table.expand().unwrap();
        // One relocation for the type-info pointer.
        assert_eq!(a.section(et).relocs.len(), 1);
        assert_eq!(a.section(et).relocs[0].sym, ti);
        // ttype encoding is indirect pcrel sdata4.
        let data = &a.section(et).data;
        assert_eq!(
            data[1],
            dw::DW_EH_PE_sdata4.0 | dw::DW_EH_PE_pcrel.0 | dw::DW_EH_PE_indirect.0
        );
    }
}
