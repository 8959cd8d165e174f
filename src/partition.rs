//! 作业拆分：文件选择、输出命名与作业输出分组
//!
//! 一个样本的输入文件按位置轮转分给 `total` 个作业：
//!
//! ```text
//!   files:  f0  f1  f2  f3  f4  f5  f6
//!   total=3 ─► job0: f0 f3 f6   job1: f1 f4   job2: f2 f5
//! ```
//!
//! 每个作业写出 `<sample>_Njobs_<total>_jobIndex_<index><ext>`，合并前
//! 需要确认同一样本的输出 `total` 一致且覆盖全部下标。

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use serde::Deserialize;
use crate::common::{Result, SystError};

const NJOBS_TAG: &str = "_Njobs_";
const INDEX_TAG: &str = "_jobIndex_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct JobSplit {
    pub total: usize,
    pub index: usize,
}

impl JobSplit {
    pub fn new(total: usize, index: usize) -> Result<Self> {
        let split = Self { total, index };
        split.validate()?;
        Ok(split)
    }

    pub fn validate(&self) -> Result<()> {
        if self.total == 0 {
            return Err(SystError::InvalidJobSplit("total must be positive".into()));
        }
        if self.index >= self.total {
            return Err(SystError::InvalidJobSplit(format!(
                "index {} out of range for {} jobs", self.index, self.total)));
        }
        Ok(())
    }
}

/// 当前作业负责的文件；未拆分时返回全部文件
pub fn select_files<S: AsRef<str>>(files: &[S], split: Option<&JobSplit>) -> Result<Vec<String>> {
    let Some(split) = split else {
        return Ok(files.iter().map(|f| f.as_ref().to_string()).collect());
    };
    split.validate()?;
    Ok(files
        .iter()
        .enumerate()
        .filter(|(i, _)| i % split.total == split.index)
        .map(|(_, f)| f.as_ref().to_string())
        .collect())
}

/// `<sample>[_Njobs_<total>_jobIndex_<index>]<ext>`
pub fn output_name(sample: &str, split: Option<&JobSplit>, extension: &str) -> String {
    match split {
        Some(s) => format!("{sample}{NJOBS_TAG}{}{INDEX_TAG}{}{extension}", s.total, s.index),
        None    => format!("{sample}{extension}"),
    }
}

/// 从作业输出文件名解析 `(total, index)`；不属于该样本时返回 None
pub fn parse_job_output(file: &str, sample: &str) -> Result<Option<JobSplit>> {
    let name = Path::new(file)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(file);
    let Some(rest) = name.strip_prefix(sample).and_then(|r| r.strip_prefix(NJOBS_TAG)) else {
        return Ok(None);
    };
    let malformed = || SystError::IncompleteJobOutputs(format!("cannot parse job output name {file}"));

    let (total, rest) = rest.split_once(INDEX_TAG).ok_or_else(malformed)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let total = total.parse::<usize>().map_err(|_| malformed())?;
    let index = digits.parse::<usize>().map_err(|_| malformed())?;
    let split = JobSplit { total, index };
    split.validate()?;
    Ok(Some(split))
}

/// 按样本收集作业输出并检查完整性
///
/// 同一样本所有输出的 `total` 必须一致，且 `0..total` 每个下标都存在。
/// 没有任何作业输出的样本不出现在结果中。
pub fn group_job_outputs<S: AsRef<str>>(
    files:   &[S],
    samples: &[S],
) -> Result<BTreeMap<String, Vec<String>>> {
    let mut grouped = BTreeMap::new();
    for sample in samples.iter().map(AsRef::as_ref) {
        let mut total   = None;
        let mut indices = BTreeSet::new();
        let mut outputs = Vec::new();
        for file in files.iter().map(AsRef::as_ref) {
            let Some(split) = parse_job_output(file, sample)? else { continue };
            match total {
                None => total = Some(split.total),
                Some(t) if t != split.total => {
                    return Err(SystError::IncompleteJobOutputs(format!(
                        "sample {sample} mixes {t} and {} jobs", split.total)));
                }
                Some(_) => {}
            }
            if !indices.insert(split.index) {
                return Err(SystError::IncompleteJobOutputs(format!(
                    "sample {sample} has job index {} twice", split.index)));
            }
            outputs.push(file.to_string());
        }
        let Some(total) = total else { continue };
        if let Some(missing) = (0..total).find(|i| !indices.contains(i)) {
            return Err(SystError::IncompleteJobOutputs(format!(
                "sample {sample} is missing job index {missing}")));
        }
        grouped.insert(sample.to_string(), outputs);
    }
    Ok(grouped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_are_dealt_round_robin() {
        let files = ["f0", "f1", "f2", "f3", "f4", "f5", "f6"];
        let split = JobSplit::new(3, 1).unwrap();
        assert_eq!(select_files(&files, Some(&split)).unwrap(), vec!["f1", "f4"]);
        assert_eq!(select_files(&files, None).unwrap().len(), 7);
        assert!(matches!(JobSplit::new(2, 2), Err(SystError::InvalidJobSplit(_))));
    }

    #[test]
    fn output_name_parses_back() {
        let split = JobSplit::new(4, 3).unwrap();
        let name  = output_name("ttbar_FS", Some(&split), ".bin");
        assert_eq!(name, "ttbar_FS_Njobs_4_jobIndex_3.bin");
        assert_eq!(parse_job_output(&format!("out/{name}"), "ttbar_FS").unwrap(), Some(split));
        assert_eq!(parse_job_output(&name, "wjets").unwrap(), None);
        assert_eq!(output_name("ttbar_FS", None, ".bin"), "ttbar_FS.bin");
    }

    #[test]
    fn grouping_requires_every_index() {
        let files = [
            "ttbar_Njobs_3_jobIndex_0.bin",
            "ttbar_Njobs_3_jobIndex_2.bin",
            "wjets_Njobs_2_jobIndex_0.bin",
            "wjets_Njobs_2_jobIndex_1.bin",
        ];
        let err = group_job_outputs(&files, &["ttbar", "wjets"]).unwrap_err();
        assert!(matches!(err, SystError::IncompleteJobOutputs(ref m) if m.contains("index 1")));

        let grouped = group_job_outputs(&files, &["wjets", "zjets"]).unwrap();
        assert_eq!(grouped["wjets"].len(), 2);
        assert!(!grouped.contains_key("zjets"));
    }

    #[test]
    fn grouping_rejects_mixed_totals() {
        let files = ["s_Njobs_2_jobIndex_0.bin", "s_Njobs_3_jobIndex_1.bin"];
        assert!(group_job_outputs(&files, &["s"]).is_err());
    }
}
