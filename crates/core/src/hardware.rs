//! Hardware profile summary and the tolerant loader for the base-info report.
//!
//! The report may be the compact JSON written by `las system detect`, the
//! older flat JSON layout, or a markdown document. Anything unreadable yields
//! a zero summary and the baseline builders fall back to conservative values.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareSummary {
    pub cpu_cores: u32,
    pub memory_kb: u64,
    pub gpu_name: String,
    pub gpu_count: u32,
}

static VRAM_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+)\s*gb").expect("static regex"));
static MEMORY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*([kmgt]?i?b|bytes?)").expect("static regex")
});
static CORES_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)-\s*(?:Cores|核心数量)\s*[:：]\s*(\d+)").expect("static regex")
});
static TOTAL_KB_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)-\s*(?:Total|总计)\s*[:：]\s*(\d+)\s*(?:kB|KB|千字节)").expect("static regex")
});
static GPU_BULLET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)-\s*GPU(?:\s*\([^)]+\)|（[^）]+）)?\s*[:：]\s*([^\n#]+)").expect("static regex")
});

impl HardwareSummary {
    pub fn memory_gib(&self) -> u64 {
        self.memory_kb / 1024 / 1024
    }

    /// Per-GPU VRAM in GB as advertised by the GPU name, 0 when unknown.
    pub fn vram_gb(&self) -> u32 {
        parse_vram_gb(&self.gpu_name)
    }

    pub fn has_gpu(&self) -> bool {
        self.gpu_count > 0 || !self.gpu_name.trim().is_empty()
    }

    /// GPU count, assuming one card when only a name with VRAM is known.
    pub fn effective_gpu_count(&self) -> u32 {
        if self.gpu_count == 0 && self.vram_gb() > 0 {
            1
        } else {
            self.gpu_count
        }
    }

    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                tracing::debug!("base info {} unavailable: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Self {
        if let Some(summary) = parse_json(content) {
            return summary;
        }
        parse_markdown(content)
    }
}

pub fn parse_vram_gb(gpu_name: &str) -> u32 {
    VRAM_PATTERN
        .captures(gpu_name)
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(0)
}

/// Converts strings like `31.2 GiB` or `1048576 kB` to kilobytes.
pub fn parse_memory_to_kb(value: &str) -> u64 {
    let Some(caps) = MEMORY_PATTERN.captures(value.trim()) else {
        return 0;
    };
    let Ok(number) = caps[1].parse::<f64>() else {
        return 0;
    };
    let kb = match caps[2].to_lowercase().as_str() {
        "b" | "byte" | "bytes" => number / 1024.0,
        "kb" | "kib" => number,
        "mb" | "mib" => number * 1024.0,
        "gb" | "gib" => number * 1024.0 * 1024.0,
        "tb" | "tib" => number * 1024.0 * 1024.0 * 1024.0,
        _ => 0.0,
    };
    kb as u64
}

#[derive(Deserialize)]
struct CompactInfo {
    #[serde(default)]
    cpu: CompactCpu,
    #[serde(default)]
    gpu: String,
    #[serde(default)]
    memory: String,
}

#[derive(Deserialize, Default)]
struct CompactCpu {
    #[serde(default)]
    cores: u32,
}

#[derive(Deserialize)]
struct LegacyInfo {
    #[serde(default)]
    cpu_cores: u32,
    #[serde(default)]
    gpu: String,
    #[serde(default)]
    memory_total: String,
}

fn parse_json(content: &str) -> Option<HardwareSummary> {
    let value: serde_json::Value = serde_json::from_str(content).ok()?;
    let legacy_layout = value.get("cpu_cores").is_some() || value.get("memory_total").is_some();

    let compact = || -> Option<HardwareSummary> {
        let info: CompactInfo = serde_json::from_value(value.clone()).ok()?;
        accept(summary_from(info.cpu.cores, &info.memory, &info.gpu), &info.gpu)
    };
    let legacy = || -> Option<HardwareSummary> {
        let info: LegacyInfo = serde_json::from_value(value.clone()).ok()?;
        accept(summary_from(info.cpu_cores, &info.memory_total, &info.gpu), &info.gpu)
    };

    if legacy_layout {
        legacy().or_else(compact)
    } else {
        compact().or_else(legacy)
    }
}

fn accept(summary: HardwareSummary, raw_gpu: &str) -> Option<HardwareSummary> {
    if summary != HardwareSummary::default() || !raw_gpu.trim().is_empty() {
        Some(summary)
    } else {
        None
    }
}

fn summary_from(cores: u32, memory: &str, gpu: &str) -> HardwareSummary {
    let entries: Vec<String> = gpu.split(['\n', ';']).filter_map(gpu_entry).collect();
    HardwareSummary {
        cpu_cores: cores,
        memory_kb: parse_memory_to_kb(memory),
        gpu_name: entries.first().cloned().unwrap_or_default(),
        gpu_count: entries.len() as u32,
    }
}

fn parse_markdown(content: &str) -> HardwareSummary {
    let cpu = markdown_section(content, "CPU");
    let memory = markdown_section(content, "Memory");
    let gpu = markdown_section(content, "GPU");

    let first_capture = |re: &Regex, scoped: &str| -> u64 {
        re.captures(scoped)
            .or_else(|| re.captures(content))
            .and_then(|caps| caps[1].parse().ok())
            .unwrap_or(0)
    };

    let mut entries = section_gpu_entries(&gpu);
    if entries.is_empty() {
        entries = GPU_BULLET_PATTERN
            .captures_iter(content)
            .filter_map(|caps| gpu_entry(&caps[1]))
            .collect();
    }

    HardwareSummary {
        cpu_cores: first_capture(&CORES_PATTERN, &cpu) as u32,
        memory_kb: first_capture(&TOTAL_KB_PATTERN, &memory),
        gpu_name: entries.first().cloned().unwrap_or_default(),
        gpu_count: entries.len() as u32,
    }
}

fn markdown_section(content: &str, name: &str) -> String {
    let escaped = regex::escape(name);
    let patterns = [
        format!(r"(?is)###\s*{}\b(.*?)(?:\n###\s|\n##\s)", escaped),
        format!(r"(?is)###\s*{}\b(.*?)(?:###|##|\z)", escaped),
    ];
    for pattern in patterns {
        let Ok(re) = Regex::new(&pattern) else {
            continue;
        };
        if let Some(caps) = re.captures(content) {
            return caps[1].trim().to_string();
        }
    }
    String::new()
}

fn section_gpu_entries(section: &str) -> Vec<String> {
    if section.trim().is_empty() {
        return Vec::new();
    }

    let mut entries: Vec<String> = GPU_BULLET_PATTERN
        .captures_iter(section)
        .filter_map(|caps| gpu_entry(&caps[1]))
        .collect();

    for line in section.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
            continue;
        }
        if line.eq_ignore_ascii_case("gpu") || line.to_lowercase().contains("gpu:") || line.contains("GPU：") {
            continue;
        }
        if let Some(entry) = gpu_entry(line) {
            entries.push(entry);
        }
    }
    entries
}

fn gpu_entry(raw: &str) -> Option<String> {
    let mut name = raw.trim();
    if let Some(idx) = name.find("##") {
        name = name[..idx].trim();
    }
    if name.is_empty() || name.to_lowercase().starts_with("unknown") {
        return None;
    }
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vram_from_gpu_name() {
        assert_eq!(parse_vram_gb("Tesla V100-SXM2-16GB"), 16);
        assert_eq!(parse_vram_gb("NVIDIA A100-SXM4-80GB"), 80);
        assert_eq!(parse_vram_gb("RTX 4090 24 GB"), 24);
        assert_eq!(parse_vram_gb("Intel UHD"), 0);
    }

    #[test]
    fn test_memory_units() {
        assert_eq!(parse_memory_to_kb("1024 kB"), 1024);
        assert_eq!(parse_memory_to_kb("2 MiB"), 2048);
        assert_eq!(parse_memory_to_kb("32 GiB"), 32 * 1024 * 1024);
        assert_eq!(parse_memory_to_kb("2048 bytes"), 2);
        assert_eq!(parse_memory_to_kb(""), 0);
        assert_eq!(parse_memory_to_kb("lots"), 0);
    }

    #[test]
    fn test_compact_json() {
        let summary = HardwareSummary::parse(
            r#"{"cpu":{"cores":32},"memory":"251.6 GiB","gpu":"NVIDIA A100-SXM4-80GB; NVIDIA A100-SXM4-80GB"}"#,
        );
        assert_eq!(summary.cpu_cores, 32);
        assert_eq!(summary.gpu_count, 2);
        assert_eq!(summary.gpu_name, "NVIDIA A100-SXM4-80GB");
        assert!(summary.memory_gib() >= 251);
    }

    #[test]
    fn test_legacy_json_skips_unknown_gpu() {
        let summary = HardwareSummary::parse(
            r#"{"cpu_cores":8,"memory_total":"16 GB","gpu":"unknown device\nTesla T4 16GB"}"#,
        );
        assert_eq!(summary.cpu_cores, 8);
        assert_eq!(summary.memory_kb, 16 * 1024 * 1024);
        assert_eq!(summary.gpu_name, "Tesla T4 16GB");
        assert_eq!(summary.gpu_count, 1);
    }

    #[test]
    fn test_markdown_report() {
        let report = "## Base Info\n### CPU\n- Model: Xeon\n- Cores: 48\n### Memory\n- Total: 32691216 kB\n### GPU\n- GPU: Tesla V100-SXM2-16GB\n- GPU: Tesla V100-SXM2-16GB\n## Disks\n";
        let summary = HardwareSummary::parse(report);
        assert_eq!(summary.cpu_cores, 48);
        assert_eq!(summary.memory_kb, 32_691_216);
        assert_eq!(summary.gpu_name, "Tesla V100-SXM2-16GB");
        assert_eq!(summary.gpu_count, 2);
    }

    #[test]
    fn test_garbage_is_zero_summary() {
        assert_eq!(HardwareSummary::parse("not a report"), HardwareSummary::default());
        assert_eq!(
            HardwareSummary::load(Path::new("/nonexistent/base_info.json")),
            HardwareSummary::default()
        );
    }

    #[test]
    fn test_effective_gpu_count() {
        let summary = HardwareSummary {
            gpu_name: "RTX 3090 24GB".to_string(),
            ..Default::default()
        };
        assert_eq!(summary.effective_gpu_count(), 1);
        assert!(summary.has_gpu());
    }
}
