use las_core::hardware::{parse_memory_to_kb, parse_vram_gb};
use las_core::HardwareSummary;
use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::System;

/// Host facts in the compact base-info layout read back by
/// [`HardwareSummary::load`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub collected_at: String,
    pub cpu: CpuInfo,
    pub memory: String,
    /// GPU names joined with `; `, empty without an NVIDIA driver.
    pub gpu: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuInfo {
    pub model: String,
    pub cores: u32,
}

impl HostSnapshot {
    pub async fn capture() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let model = sys
            .cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .unwrap_or_default();
        let memory = format!("{:.1} GiB", sys.total_memory() as f64 / 1024.0 / 1024.0 / 1024.0);

        Self {
            collected_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            cpu: CpuInfo {
                model,
                cores: sys.cpus().len() as u32,
            },
            memory,
            gpu: query_gpus().await.join("; "),
        }
    }

    pub fn summary(&self) -> HardwareSummary {
        let gpus: Vec<&str> = self
            .gpu
            .split(';')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .collect();
        HardwareSummary {
            cpu_cores: self.cpu.cores,
            memory_kb: parse_memory_to_kb(&self.memory),
            gpu_name: gpus.first().map(|g| g.to_string()).unwrap_or_default(),
            gpu_count: gpus.len() as u32,
        }
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    pub fn to_concise_string(&self) -> String {
        format!(
            "CPU: {} ({} cores)\nMemory: {}\nGPU: {}",
            if self.cpu.model.is_empty() { "unknown" } else { &self.cpu.model },
            self.cpu.cores,
            self.memory,
            if self.gpu.is_empty() { "none" } else { &self.gpu }
        )
    }
}

async fn query_gpus() -> Vec<String> {
    let output = tokio::process::Command::new("nvidia-smi")
        .args(["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"])
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout)),
        Ok(out) => {
            tracing::debug!("nvidia-smi exited with {}", out.status);
            Vec::new()
        }
        Err(e) => {
            tracing::debug!("nvidia-smi unavailable: {}", e);
            Vec::new()
        }
    }
}

/// One entry per `name, memory MiB` row. Names that do not already state
/// their memory get a `NNGB` suffix so VRAM tiers can be derived later.
pub fn parse_nvidia_smi(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let (name, memory) = match line.rsplit_once(',') {
                Some((name, memory)) => (name.trim(), memory.trim()),
                None => (line.trim(), ""),
            };
            if name.is_empty() {
                return None;
            }
            if parse_vram_gb(name) > 0 {
                return Some(name.to_string());
            }
            match memory.parse::<f64>() {
                Ok(mib) if mib > 0.0 => Some(format!("{} {}GB", name, (mib / 1024.0).round() as u64)),
                _ => Some(name.to_string()),
            }
        })
        .collect()
}
