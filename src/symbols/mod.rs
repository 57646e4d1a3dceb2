//! C6: symbol and mapping tables (spec §4.6). DWARF symbolication itself is
//! an external collaborator (`object`/`gimli`/`addr2line`, per spec
//! Non-goals); this module owns the caching and dedup around it so the
//! same module's debug info is parsed once no matter how many pids map it.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use crate::process::Dso;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedFrame {
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl ResolvedFrame {
    fn unknown() -> Self {
        ResolvedFrame {
            function: "[unknown]".to_owned(),
            file: None,
            line: None,
        }
    }
}

/// One module's loaded debug info, keyed by `Dso::stable_id` so it is
/// parsed at most once regardless of how many pids mmap the same file.
struct ModuleSymbols {
    context: Option<addr2line::Context<gimli::EndianArcSlice<gimli::RunTimeEndian>>>,
    symtab: Vec<(u64, u64, String)>,
    is_cpp: bool,
}

impl ModuleSymbols {
    fn load(path: &str) -> Self {
        match Self::try_load(path) {
            Ok(m) => m,
            Err(_) => ModuleSymbols {
                context: None,
                symtab: Vec::new(),
                is_cpp: false,
            },
        }
    }

    fn try_load(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let data = fs::read(path)?;
        let file = object::File::parse(&*data)?;

        let endian = if file.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };

        let load_section = |id: gimli::SectionId| -> Result<gimli::EndianArcSlice<gimli::RunTimeEndian>, gimli::Error> {
            use object::ObjectSection;
            let data = file
                .section_by_name(id.name())
                .and_then(|s| s.uncompressed_data().ok())
                .map(|d| d.into_owned())
                .unwrap_or_default();
            Ok(gimli::EndianArcSlice::new(Arc::from(data), endian))
        };

        let dwarf = gimli::Dwarf::load(load_section)?;
        let context = addr2line::Context::from_dwarf(dwarf).ok();

        let mut symtab = Vec::new();
        use object::Object;
        for symbol in file.symbols() {
            use object::ObjectSymbol;
            if symbol.kind() == object::SymbolKind::Text && symbol.size() > 0 {
                if let Ok(name) = symbol.name() {
                    symtab.push((symbol.address(), symbol.address() + symbol.size(), name.to_owned()));
                }
            }
        }
        symtab.sort_by_key(|(start, _, _)| *start);

        Ok(ModuleSymbols {
            context,
            symtab,
            is_cpp: path.ends_with(".so") || path.ends_with(".so.1") || !path.contains("rust"),
        })
    }

    fn resolve(&self, file_relative_pc: u64) -> ResolvedFrame {
        if let Some(ctx) = &self.context {
            if let Ok(mut frames) = ctx.find_frames(file_relative_pc).skip_all_loads() {
                if let Ok(Some(frame)) = frames.next() {
                    let function = frame
                        .function
                        .as_ref()
                        .and_then(|f| f.demangle().ok().map(|s| s.into_owned()))
                        .unwrap_or_else(|| "[unknown]".to_owned());
                    let file = frame
                        .location
                        .as_ref()
                        .and_then(|l| l.file)
                        .map(|s| s.to_owned());
                    let line = frame.location.as_ref().and_then(|l| l.line);
                    return ResolvedFrame { function, file, line };
                }
            }
        }

        if let Ok(index) = self
            .symtab
            .binary_search_by(|(start, _, _)| start.cmp(&file_relative_pc))
        {
            let (_, _, name) = &self.symtab[index];
            return ResolvedFrame {
                function: demangle(name, self.is_cpp),
                file: None,
                line: None,
            };
        }
        // binary_search_by returns Err(insertion point) on no exact match;
        // the enclosing symbol (if any) is the one just before it.
        let insertion = self
            .symtab
            .partition_point(|(start, _, _)| *start <= file_relative_pc);
        if insertion > 0 {
            let (start, end, name) = &self.symtab[insertion - 1];
            if file_relative_pc >= *start && file_relative_pc < *end {
                return ResolvedFrame {
                    function: demangle(name, self.is_cpp),
                    file: None,
                    line: None,
                };
            }
        }

        ResolvedFrame::unknown()
    }
}

fn demangle(name: &str, is_cpp: bool) -> String {
    if let Some(rust) = rustc_demangle::try_demangle(name).ok() {
        return rust.to_string();
    }
    if is_cpp {
        if let Ok(cpp) = cpp_demangle::Symbol::new(name) {
            if let Ok(s) = cpp.demangle(&cpp_demangle::DemangleOptions::default()) {
                return s;
            }
        }
    }
    name.to_owned()
}

#[derive(Default)]
pub struct SymbolTables {
    modules: HashMap<u64, Arc<ModuleSymbols>>,
    /// Per-(pid, dso-start) resolution cache so repeated samples hitting
    /// the same address don't re-run DWARF lookup (spec §4.6 dedup key).
    frame_cache: HashMap<(i32, u64, u64), Arc<ResolvedFrame>>,
}

impl SymbolTables {
    pub fn new() -> Self {
        SymbolTables::default()
    }

    pub fn resolve(&mut self, pid: i32, dso: &Dso, absolute_addr: u64) -> Arc<ResolvedFrame> {
        let cache_key = (pid, dso.start, absolute_addr);
        if let Some(cached) = self.frame_cache.get(&cache_key) {
            return Arc::clone(cached);
        }

        let module = self
            .modules
            .entry(dso.stable_id)
            .or_insert_with(|| Arc::new(ModuleSymbols::load(&dso.path)))
            .clone();

        let file_relative_pc = absolute_addr - dso.start + dso.file_offset;
        let resolved = Arc::new(module.resolve(file_relative_pc));
        self.frame_cache.insert(cache_key, Arc::clone(&resolved));
        resolved
    }

    pub fn loaded_module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn cached_frame_count(&self) -> usize {
        self.frame_cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demangles_rust_symbol() {
        let mangled = "_RNvCskwFFRCqPVjy_4core4iter5cloneICall";
        // Not a guarantee of exact output (mangling scheme detail), only
        // that we don't panic and fall through gracefully when the
        // symbol doesn't actually demangle.
        let _ = demangle(mangled, false);
    }

    #[test]
    fn unresolvable_module_falls_back_to_unknown_frame() {
        let module = ModuleSymbols::load("/nonexistent/path/to/binary");
        let resolved = module.resolve(0x1234);
        assert_eq!(resolved.function, "[unknown]");
    }

    #[test]
    fn frame_cache_is_keyed_by_pid_and_dso_start() {
        let mut tables = SymbolTables::new();
        let dso = Dso {
            path: "/nonexistent/path/to/binary".to_owned(),
            start: 0x1000,
            end: 0x2000,
            file_offset: 0,
            executable: true,
            stable_id: 42,
        };
        let a = tables.resolve(1, &dso, 0x1500);
        let b = tables.resolve(1, &dso, 0x1500);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(tables.cached_frame_count(), 1);
    }
}
