//! The per-module compilation driver.
//!
//! Creates one symbol per function up front (so calls between functions
//! resolve), then compiles function by function. A function the lowering
//! layer rejects is skipped: its symbol stays undefined, every other
//! function still lands in the object, and the rejection is reported in
//! [`CompiledModule::skipped`] as [`CodegenError::Unsupported`] with the
//! offending construct. Fatal conditions (malformed IR, object limits)
//! surface as the module-level `Err`.

use crate::adaptor::{IrAdaptor, Linkage};
use crate::asm::{Assembler, SymBinding};
use crate::codegen::{Backend, CodeGen};
use crate::isa::Machine;
use crate::{CodegenError, CodegenResult};
use log::{info, warn};
use rustc_hash::FxHashMap;

/// Module-level knobs.
#[derive(Clone, Debug)]
pub struct ModuleConfig {
    /// Target architecture; must match the backend's machine.
    pub arch: target_lexicon::Architecture,
    /// Permit duplicate definitions of the same name (both symbols are
    /// emitted; the link decides) instead of failing the module.
    pub allow_duplicate_definitions: bool,
}

impl ModuleConfig {
    pub fn for_machine<M: Machine>() -> Self {
        ModuleConfig {
            arch: M::arch(),
            allow_duplicate_definitions: false,
        }
    }
}

fn binding_of(linkage: Linkage) -> SymBinding {
    match linkage {
        Linkage::Export => SymBinding::Global,
        Linkage::Weak => SymBinding::Weak,
        Linkage::Local => SymBinding::Local,
    }
}

/// The outcome of a module compilation.
pub struct CompiledModule {
    /// The assembler with all sections, symbols and relocations
    /// populated.
    pub assembler: Assembler,
    /// Functions that were skipped, as `(link name, error)` pairs; their
    /// symbols are present but undefined.
    pub skipped: Vec<(String, CodegenError)>,
}

/// Compile every function of `adaptor`'s module and serialize a
/// relocatable ELF object.
pub fn compile_object<A, B>(adaptor: &mut A, config: &ModuleConfig) -> CodegenResult<Vec<u8>>
where
    A: IrAdaptor,
    B: Backend<A>,
{
    let compiled = compile_module::<A, B>(adaptor, config)?;
    compiled.assembler.build_object()
}

/// Compile every function. The returned [`CompiledModule`] carries the
/// populated assembler (`capstan-jit` maps it without a linker in the
/// loop) and the list of functions that were dropped as unsupported.
pub fn compile_module<A, B>(adaptor: &mut A, config: &ModuleConfig) -> CodegenResult<CompiledModule>
where
    A: IrAdaptor,
    B: Backend<A>,
{
    if config.arch != B::Mach::arch() {
        return Err(CodegenError::UnsupportedTarget(config.arch));
    }

    let mut asm = Assembler::new(B::Mach::target_info());
    let mut names: FxHashMap<String, ()> = FxHashMap::default();

    // Pre-create all function symbols.
    let funcs: Vec<A::Func> = adaptor.funcs().collect();
    let mut func_syms = Vec::with_capacity(funcs.len());
    for &func in &funcs {
        let name = adaptor.func_link_name(func).to_string();
        let binding = binding_of(adaptor.func_linkage(func));
        if !adaptor.func_extern(func)
            && names.insert(name.clone(), ()).is_some()
            && !config.allow_duplicate_definitions
        {
            return Err(CodegenError::DuplicateSymbol(name));
        }
        let sym = if adaptor.func_extern(func) {
            asm.sym_add_undef(&name, binding)
        } else {
            asm.sym_predef_func(&name, binding)
        };
        func_syms.push(sym);
    }

    let mut skipped = Vec::new();
    {
        let mut cg = CodeGen::<A, B>::new(adaptor, &mut asm);
        cg.func_syms = func_syms;

        for (idx, &func) in funcs.iter().enumerate() {
            if cg.adaptor.func_extern(func) {
                continue;
            }
            info!("compiling function {}", cg.adaptor.func_link_name(func));
            if let Err(err) = cg.compile_func(func, idx as u32) {
                let name = cg.adaptor.func_link_name(func).to_string();
                warn!("skipping function {name}: {err}");
                skipped.push((name, err));
            }
        }
    }

    adaptor.reset();
    Ok(CompiledModule {
        assembler: asm,
        skipped,
    })
}
