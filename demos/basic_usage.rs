//! # syst-variation-engine 完整使用案例
//!
//! 1. 初始化日志
//! 2. 从 JSON 读取处理配置
//! 3. 单独演示登记表与 ColumnGraphBuilder
//! 4. 注册用户回调
//! 5. 并行处理两个分区并按序合并
//! 6. 写入 KeyedStore、编码为容器并校验
//! 7. 作业拆分与作业输出分组

use std::collections::BTreeMap;
use tracing::info_span;
use syst_variation_engine::{
    builder::ColumnGraphBuilder,
    common::Result,
    config::ProcessConfig,
    engine::{ExecutionEngine, MemoryFrame, Transform},
    hooks::DefinitionHooks,
    logging::{self, LogLevel},
    partition::{group_job_outputs, output_name, select_files, JobSplit},
    pipeline::SampleProcessor,
    registry::{AffectedColumnRegistry, RegistryOptions},
    sink::{write_tree, Codec, KeyedStore, WriteOptions},
};

const CONFIG: &str = r#"{
    "regions": [
        {
            "name": "SR",
            "selection": "jet_pt_NOSYS > 30",
            "variables": [
                { "name": "jet_pt", "definition": "jet_pt_NOSYS", "axis": { "nbins": 10, "min": 0, "max": 200 } },
                { "name": "jet_e",  "definition": "jet_e_NOSYS",  "axis": { "nbins": 10, "min": 0, "max": 400 } },
                { "name": "met",    "definition": "met_NOSYS",    "axis": { "nbins": 5,  "min": 0, "max": 100 },
                  "nominal_only": true }
            ],
            "combinations_2d": [["jet_pt", "jet_e"]]
        }
    ],
    "samples": [
        {
            "name": "ttbar",
            "weight": "weight_mc_NOSYS * weight_pileup_NOSYS",
            "luminosity": 140.0,
            "cross_section": 0.8,
            "sum_weights": { "NOSYS": 1000.0, "PRW_UP": 980.0 },
            "variations": [
                { "name": "JET_PT_UP" },
                { "name": "PRW_UP", "weight_key": "PRW_UP" }
            ],
            "cutflows": [
                { "name": "presel", "selections": [
                    { "selection": "met_NOSYS > 20", "title": "MET" },
                    { "selection": "jet_pt_NOSYS > 30", "title": "JetPt" }
                ] }
            ]
        }
    ],
    "options": { "match_mode": "TokenBoundary" }
}"#;

fn partition(id: &str) -> Result<MemoryFrame> {
    let shift = if id == "p1" { 15.0 } else { 0.0 };
    MemoryFrame::new(info_span!("frame", partition = id))
        .with_column("jet_pt_NOSYS",        vec![25.0 + shift, 45.0, 80.0, 120.0 + shift])?
        .with_column("jet_pt_JET_PT_UP",    vec![27.0 + shift, 48.0, 84.0, 126.0 + shift])?
        .with_column("jet_eta",             vec![0.1, -1.2, 2.0, 0.5])?
        .with_column("met_NOSYS",           vec![10.0, 35.0, 60.0, 22.0])?
        .with_column("weight_mc_NOSYS",     vec![1.0, 0.9, 1.1, 1.0])?
        .with_column("weight_pileup_NOSYS", vec![1.0, 1.0, 0.95, 1.05])?
        .with_column("weight_pileup_PRW_UP", vec![1.1, 1.0, 1.0, 1.1])
}

fn main() -> Result<()> {
    println!("═══════════════════════════════════════════════════════════");
    println!("   syst-variation-engine 演示                              ");
    println!("═══════════════════════════════════════════════════════════\n");

    // =========================================================================
    // 1. 日志
    // =========================================================================
    println!("【1】初始化日志 ...");
    logging::init(LogLevel::Info);
    println!("    ✓ OK\n");

    // =========================================================================
    // 2. 配置
    // =========================================================================
    println!("【2】读取处理配置 ...");
    let config = ProcessConfig::from_json(CONFIG)?;
    println!("    regions = {}", config.regions.len());
    println!("    samples = {}\n", config.samples.len());

    // =========================================================================
    // 3. 登记表 + 构图
    // =========================================================================
    println!("【3】登记表与变化副本 ...");
    let frame = partition("p0")?;
    let variations: Vec<String> = ["NOSYS", "JET_PT_UP", "PRW_UP"].map(String::from).to_vec();
    let registry = AffectedColumnRegistry::build(
        frame.list_columns(), &variations, RegistryOptions::default(), info_span!("registry"),
    )?;
    for (v, affected) in registry.snapshot() {
        println!("    {v:<10} → {affected:?}");
    }
    let mut builder = ColumnGraphBuilder::new(registry, frame, info_span!("builder"));
    let defined = builder.define(
        "jet_e_NOSYS",
        Transform::closure(|v| v[0] * v[1].cosh()),
        &["jet_pt_NOSYS".to_string(), "jet_eta".to_string()],
    )?;
    println!("    define(jet_e_NOSYS) → {defined:?}\n");

    // =========================================================================
    // 4. 用户回调
    // =========================================================================
    println!("【4】注册 reco 回调（jet_e_NOSYS）...");
    let hooks = DefinitionHooks::new().with_reco(|b: &mut ColumnGraphBuilder<MemoryFrame>, _ctx| {
        b.string_define("jet_e_NOSYS", "jet_pt_NOSYS * cosh(jet_eta)")?;
        Ok(())
    });
    println!("    ✓ OK\n");

    // =========================================================================
    // 5. 并行处理分区
    // =========================================================================
    println!("【5】并行处理分区 p0, p1 ...");
    let processor = SampleProcessor::new(&config, &hooks, info_span!("process"));
    let ids = vec!["p0".to_string(), "p1".to_string()];
    let Some(tree) = processor.process_sample_parallel("ttbar", &ids, partition)? else {
        println!("    没有任何事件");
        return Ok(());
    };
    for v in &tree.variations {
        for r in &v.regions {
            for res in &r.results {
                if let Some(h) = res.as_histogram() {
                    println!("    {:<10} {:<4} {:<16} integral = {:.3}", v.name, r.name, res.name, h.integral());
                }
            }
        }
    }
    if let Some(c) = tree.cutflow("presel") {
        for s in &c.stages {
            println!("    cutflow {:<8} Σw = {:.3}", s.label, s.sum_weight);
        }
    }
    println!();

    // =========================================================================
    // 6. 写出并编码
    // =========================================================================
    println!("【6】写入 KeyedStore 并编码 ...");
    let mut store = KeyedStore::new();
    let written = write_tree(&tree, &mut store, WriteOptions::default(), &info_span!("sink"))?;
    let bytes   = store.encode(Codec::Lz4)?;
    let decoded = KeyedStore::decode(&bytes)?;
    println!("    objects = {written}, bytes = {}", bytes.len());
    println!("    decoded == written : {}\n", decoded == store);

    // =========================================================================
    // 7. 作业拆分
    // =========================================================================
    println!("【7】作业拆分 ...");
    let files = ["a.root", "b.root", "c.root", "d.root", "e.root"];
    let mut outputs = Vec::new();
    for index in 0..2 {
        let split = JobSplit::new(2, index)?;
        println!("    job {index}: {:?}", select_files(&files, Some(&split))?);
        outputs.push(output_name("ttbar", Some(&split), ".bin"));
    }
    let grouped: BTreeMap<String, Vec<String>> = group_job_outputs(&outputs[..], &["ttbar".to_string()])?;
    println!("    grouped = {grouped:?}");

    println!("\n═══════════════════════════════════════════════════════════");
    println!("   完成");
    println!("═══════════════════════════════════════════════════════════");
    Ok(())
}
