//! The four on-disk text formats the toolchain passes between stages:
//! memory-profile CSV, time-profile CSV, malloc-plan file, and
//! layer-dependency file, plus the debug memory-layout dump. Grounded on
//! `src/profiler.cpp`'s `save()` methods and
//! `examples/flexnnschedule.h`'s `read_memory_profile`/`read_time_profile`/
//! `write_malloc_plan`/`write_layer_dependencies`/`write_memory_layout`.

use std::fs;
use std::io::Write as _;
use std::path::Path;

use crate::errors::{FlexError, FlexResult};
use crate::profiler::memory::MemoryProfilerEvent;
use crate::profiler::time::LayerTimeProfile;
use crate::scheduler::MallocPlan;
use crate::types::MemoryClass;

const MEMORY_PROFILE_HEADER: &str = "layer_index,memory_type,event_type,ptr,size,time";
const TIME_PROFILE_HEADER: &str = "layer_index,loading_begin,loading_end,loading_duration,computing_begin,computing_end,computing_duration";

fn write_atomic(path: &Path, contents: &str) -> FlexResult<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| FlexError::io(path.display().to_string(), e))?;
    tmp.write_all(contents.as_bytes()).map_err(|e| FlexError::io(path.display().to_string(), e))?;
    tmp.persist(path).map_err(|e| FlexError::io(path.display().to_string(), e.error))?;
    Ok(())
}

/// Writes memory-profiler events as CSV, `ptr` rendered as a hex address
/// the way the original's `%p` format specifier would.
pub fn write_memory_profile_events(path: &Path, events: &[MemoryProfilerEvent]) -> FlexResult<()> {
    let mut out = String::new();
    out.push_str(MEMORY_PROFILE_HEADER);
    out.push('\n');
    for e in events {
        out.push_str(&format!("{},{},{},0x{:x},{},{}\n", e.layer_index, e.memory_type.as_index(), if e.is_malloc { 1 } else { 0 }, e.ptr, e.size, e.time_ms));
    }
    write_atomic(path, &out)
}

/// Reads a memory-profile CSV back into events, skipping `#`-comment and
/// header lines and tolerating a trailing blank line; a malformed data
/// row (wrong field count) is a `CsvFormat` error, matching the
/// original's `sscanf` field-count check.
pub fn read_memory_profile_events(path: &Path) -> FlexResult<Vec<MemoryProfilerEvent>> {
    let text = fs::read_to_string(path).map_err(|e| FlexError::io(path.display().to_string(), e))?;
    let mut events = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line == MEMORY_PROFILE_HEADER {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != 6 {
            return Err(FlexError::CsvFormat(format!("expected 6 fields in memory profile row, got {}: {}", fields.len(), line)));
        }
        let layer_index = parse_field::<usize>(fields[0], "layer_index", line)?;
        let memory_type_index = parse_field::<usize>(fields[1], "memory_type", line)?;
        let memory_type = MemoryClass::from_index(memory_type_index).ok_or_else(|| FlexError::CsvFormat(format!("bad memory_type field in: {}", line)))?;
        let event_type = parse_field::<u8>(fields[2], "event_type", line)?;
        let ptr = parse_ptr(fields[3], line)?;
        let size = parse_field::<usize>(fields[4], "size", line)?;
        let time_ms = fields[5].parse::<f64>().map_err(|_| FlexError::CsvFormat(format!("bad time field in: {}", line)))?;
        events.push(MemoryProfilerEvent { layer_index, memory_type, is_malloc: event_type == 1, ptr, size, time_ms });
    }
    Ok(events)
}

fn parse_field<T: std::str::FromStr>(field: &str, name: &'static str, line: &str) -> FlexResult<T> {
    field.parse::<T>().map_err(|_| FlexError::CsvFormat(format!("bad {} field in: {}", name, line)))
}

fn parse_ptr(field: &str, line: &str) -> FlexResult<u64> {
    let field = field.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(field, 16).map_err(|_| FlexError::CsvFormat(format!("bad ptr field in: {}", line)))
}

/// Writes per-layer time profiles as CSV.
pub fn write_time_profile(path: &Path, profiles: &[LayerTimeProfile]) -> FlexResult<()> {
    let mut out = String::new();
    out.push_str(TIME_PROFILE_HEADER);
    out.push('\n');
    for p in profiles {
        out.push_str(&format!("{},{},{},{},{},{},{}\n", p.layer_index, p.loading_begin, p.loading_end, p.loading_duration, p.computing_begin, p.computing_end, p.computing_duration));
    }
    write_atomic(path, &out)
}

/// Reads back a time-profile CSV, skipping comments/header as above.
pub fn read_time_profile(path: &Path) -> FlexResult<Vec<LayerTimeProfile>> {
    let text = fs::read_to_string(path).map_err(|e| FlexError::io(path.display().to_string(), e))?;
    let mut profiles = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line == TIME_PROFILE_HEADER {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != 7 {
            return Err(FlexError::CsvFormat(format!("expected 7 fields in time profile row, got {}: {}", fields.len(), line)));
        }
        let layer_index = parse_field::<usize>(fields[0], "layer_index", line)?;
        let loading_begin = fields[1].parse::<f64>().map_err(|_| FlexError::CsvFormat(format!("bad loading_begin in: {}", line)))?;
        let loading_end = fields[2].parse::<f64>().map_err(|_| FlexError::CsvFormat(format!("bad loading_end in: {}", line)))?;
        let computing_begin = fields[4].parse::<f64>().map_err(|_| FlexError::CsvFormat(format!("bad computing_begin in: {}", line)))?;
        let computing_end = fields[5].parse::<f64>().map_err(|_| FlexError::CsvFormat(format!("bad computing_end in: {}", line)))?;
        profiles.push(LayerTimeProfile::new(layer_index, loading_begin, loading_end, computing_begin, computing_end));
    }
    Ok(profiles)
}

/// Writes a malloc plan: header counts line, then each class's offsets
/// under a `#`-prefixed section label, matching
/// `FlexnnSchedule::write_malloc_plan`.
pub fn write_malloc_plan(path: &Path, plan: &MallocPlan) -> FlexResult<()> {
    let mut out = String::new();
    out.push_str("# weight_count blob_count intermediate_count (persistent_count)\n");
    out.push_str(&format!("{} {} {}", plan.weight.len(), plan.blob.len(), plan.workspace.len()));
    if !plan.persistent.is_empty() {
        out.push_str(&format!(" {}", plan.persistent.len()));
    }
    out.push('\n');
    out.push_str("# weight_offsets\n");
    for o in &plan.weight {
        out.push_str(&format!("{}\n", o));
    }
    out.push_str("# blob_offsets\n");
    for o in &plan.blob {
        out.push_str(&format!("{}\n", o));
    }
    out.push_str("# intermediate_offsets\n");
    for o in &plan.workspace {
        out.push_str(&format!("{}\n", o));
    }
    out.push_str("# persistent_offsets\n");
    for o in &plan.persistent {
        out.push_str(&format!("{}\n", o));
    }
    write_atomic(path, &out)
}

/// Reads a malloc plan, using the header counts line to split the
/// flat offset stream that follows into weight/blob/workspace/persistent
/// sections, tolerant of the `#`-prefixed section labels.
pub fn read_malloc_plan(path: &Path) -> FlexResult<MallocPlan> {
    let text = fs::read_to_string(path).map_err(|e| FlexError::io(path.display().to_string(), e))?;
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());

    let header = lines.by_ref().find(|l| !l.trim_start().starts_with('#')).ok_or_else(|| FlexError::CsvFormat("missing malloc plan header line".into()))?;
    let counts: Vec<usize> = header
        .split_whitespace()
        .map(|f| f.parse::<usize>().map_err(|_| FlexError::CsvFormat(format!("bad count field in: {}", header))))
        .collect::<FlexResult<Vec<_>>>()?;
    if counts.len() < 3 {
        return Err(FlexError::CsvFormat(format!("expected at least 3 counts, got: {}", header)));
    }
    let (weight_count, blob_count, workspace_count) = (counts[0], counts[1], counts[2]);
    let persistent_count = counts.get(3).copied().unwrap_or(0);

    let mut offsets = Vec::new();
    for line in lines {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        offsets.push(line.parse::<usize>().map_err(|_| FlexError::CsvFormat(format!("bad offset field in: {}", line)))?);
    }

    let mut cursor = 0;
    let mut take = |count: usize| -> FlexResult<Vec<usize>> {
        if cursor + count > offsets.len() {
            return Err(FlexError::CsvFormat(format!("malloc plan truncated: expected {} more offsets at position {}", count, cursor)));
        }
        let slice = offsets[cursor..cursor + count].to_vec();
        cursor += count;
        Ok(slice)
    };

    let weight = take(weight_count)?;
    let blob = take(blob_count)?;
    let workspace = take(workspace_count)?;
    let persistent = take(persistent_count)?;

    Ok(MallocPlan { weight, blob, workspace, persistent })
}

/// Writes the layer-dependency vector, one offset per line.
pub fn write_layer_dependencies(path: &Path, dependencies: &[usize]) -> FlexResult<()> {
    let mut out = String::new();
    for d in dependencies {
        out.push_str(&format!("{}\n", d));
    }
    write_atomic(path, &out)
}

pub fn read_layer_dependencies(path: &Path) -> FlexResult<Vec<usize>> {
    let text = fs::read_to_string(path).map_err(|e| FlexError::io(path.display().to_string(), e))?;
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.parse::<usize>().map_err(|_| FlexError::CsvFormat(format!("bad dependency field in: {}", l))))
        .collect()
}

/// Writes the debug memory-layout dump: one row per placed profile,
/// `x,end_layer_index,y,size,start_layer_index,memory_type`, matching
/// `FlexnnSchedule::write_memory_layout`'s field order exactly.
pub fn write_memory_layout(path: &Path, placements: &[crate::scheduler::PlacedProfile]) -> FlexResult<()> {
    let mut out = String::new();
    for p in placements {
        out.push_str(&format!("{},{},{},{},{},{}\n", p.x, p.end_layer_index, p.y, p.size, p.start_layer_index, p.memory_type.as_index()));
    }
    write_atomic(path, &out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn malloc_plan_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plan.txt");
        let plan = MallocPlan { weight: vec![0, 16, 32], blob: vec![64, 128], workspace: vec![256], persistent: vec![0, 16] };
        write_malloc_plan(&path, &plan).unwrap();
        let read_back = read_malloc_plan(&path).unwrap();
        assert_eq!(read_back.weight, plan.weight);
        assert_eq!(read_back.blob, plan.blob);
        assert_eq!(read_back.workspace, plan.workspace);
        assert_eq!(read_back.persistent, plan.persistent);
    }

    #[test]
    fn malloc_plan_without_persistent_section_reads_back_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plan.txt");
        let plan = MallocPlan { weight: vec![0], blob: vec![16], workspace: vec![], persistent: vec![] };
        write_malloc_plan(&path, &plan).unwrap();
        let read_back = read_malloc_plan(&path).unwrap();
        assert!(read_back.persistent.is_empty());
    }

    #[test]
    fn layer_dependencies_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deps.txt");
        let deps = vec![2usize, 2, 3, 4, 5];
        write_layer_dependencies(&path, &deps).unwrap();
        assert_eq!(read_layer_dependencies(&path).unwrap(), deps);
    }

    #[test]
    fn memory_profile_events_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mem.csv");
        let events = vec![
            MemoryProfilerEvent { layer_index: 0, memory_type: MemoryClass::Weight, is_malloc: true, ptr: 0x1000, size: 64, time_ms: 0.5 },
            MemoryProfilerEvent { layer_index: 1, memory_type: MemoryClass::Weight, is_malloc: false, ptr: 0x1000, size: 0, time_ms: 1.5 },
        ];
        write_memory_profile_events(&path, &events).unwrap();
        let read_back = read_memory_profile_events(&path).unwrap();
        assert_eq!(read_back.len(), 2);
        assert_eq!(read_back[0].ptr, 0x1000);
        assert!(read_back[0].is_malloc);
        assert!(!read_back[1].is_malloc);
    }

    #[test]
    fn malformed_row_is_csv_format_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deps.txt");
        fs::write(&path, "2\nnot-a-number\n").unwrap();
        let err = read_layer_dependencies(&path).unwrap_err();
        assert!(matches!(err, FlexError::CsvFormat(_)));
    }
}
