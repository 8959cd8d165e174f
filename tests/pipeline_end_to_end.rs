use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use approx::assert_relative_eq;
use tracing::Span;
use syst_variation_engine::builder::ColumnGraphBuilder;
use syst_variation_engine::common::SystError;
use syst_variation_engine::config::{
    CutflowConfig, ProcessConfig, RegionConfig, SampleConfig, VariableConfig, VariationConfig,
};
use syst_variation_engine::engine::{MemoryFrame, Transform};
use syst_variation_engine::histogram::Axis;
use syst_variation_engine::hooks::DefinitionHooks;
use syst_variation_engine::partition::{group_job_outputs, output_name, select_files, JobSplit};
use syst_variation_engine::pipeline::SampleProcessor;
use syst_variation_engine::sink::{merge_store, write_tree, Codec, KeyedStore, WriteOptions};

fn frame(id: &str) -> MemoryFrame {
    let (pt, pt_up, met, w): (Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>) = match id {
        "p0" => (vec![0.5, 1.5, 2.5], vec![1.2, 1.8, 2.9], vec![1.0, 0.0, 3.0], vec![1.0, 2.0, 3.0]),
        "p1" => (vec![3.5], vec![3.6], vec![0.5], vec![0.5]),
        _    => return MemoryFrame::new(Span::none()),
    };
    MemoryFrame::new(Span::none())
        .with_column("jet_pt_NOSYS", pt).unwrap()
        .with_column("jet_pt_JES_UP", pt_up).unwrap()
        .with_column("met_NOSYS", met).unwrap()
        .with_column("weight_mc_NOSYS", w).unwrap()
        .with_listed_variations(&["NOSYS", "JES_UP", "JER_DOWN"])
}

fn config() -> ProcessConfig {
    let region = RegionConfig::new("SR", "jet_pt_NOSYS > 1")
        .with_variable(VariableConfig::new("jet_pt", "jet_pt_NOSYS", Axis::new(5, 0.0, 5.0)))
        .with_variable(VariableConfig::new("met", "met_NOSYS", Axis::new(4, 0.0, 4.0)))
        .with_variable(VariableConfig::new("ht", "ht_NOSYS", Axis::new(10, 0.0, 10.0)).nominal_only())
        .with_2d("jet_pt", "met");
    let sample = SampleConfig::new("ttbar")
        .with_weight("weight_mc_NOSYS")
        .with_normalisation(2.0, 5.0)
        .with_sum_weights("NOSYS", 10.0)
        .with_variation(VariationConfig::new("JES_UP"))
        .with_define("ht_NOSYS", "jet_pt_NOSYS + met_NOSYS")
        .with_cutflow(CutflowConfig::new("main").with_stage("met_NOSYS > 0", "MET"))
        .with_ntuple_selection("jet_pt_NOSYS > 1");
    ProcessConfig::new(vec![region], vec![sample])
}

fn counting_hooks(region_calls: Arc<AtomicUsize>) -> DefinitionHooks<MemoryFrame> {
    DefinitionHooks::new()
        .with_reco(|b: &mut ColumnGraphBuilder<MemoryFrame>, _ctx| {
            b.define(
                "jet_pt2_NOSYS",
                Transform::closure(|v| v[0] * v[0]),
                &["jet_pt_NOSYS".to_string()],
            )?;
            Ok(())
        })
        .with_region(move |_b, ctx| {
            assert_eq!(ctx.region, Some("SR"));
            region_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
}

#[test]
fn sample_is_processed_and_merged_across_partitions() {
    let config = config();
    let calls  = Arc::new(AtomicUsize::new(0));
    let hooks  = counting_hooks(calls.clone());
    let processor = SampleProcessor::new(&config, &hooks, Span::none());

    let partitions = ["p0", "p_empty", "p1"].map(|id| (id.to_string(), frame(id)));
    let tree = processor.process_sample("ttbar", partitions).unwrap().unwrap();

    assert!(tree.is_materialized());
    // 两个非空分区，每个分区的区域回调只调一次
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let nominal = tree.histogram("NOSYS", "SR", "jet_pt").unwrap();
    assert_relative_eq!(nominal.integral(), 5.5);
    let shifted = tree.histogram("JES_UP", "SR", "jet_pt").unwrap();
    assert_relative_eq!(shifted.integral(), 6.5);

    assert!(tree.histogram("NOSYS", "SR", "ht").is_some());
    assert!(tree.find("JES_UP", "SR", "ht").is_none());
    assert!(tree.histogram("JES_UP", "SR", "jet_pt_vs_met").is_some());

    let cutflow = tree.cutflow("main").unwrap();
    assert_eq!(cutflow.stages[0].label, "Initial");
    assert_relative_eq!(cutflow.stages[0].sum_weight, 6.5);
    assert_relative_eq!(cutflow.stages[1].sum_weight, 4.5);
    assert_relative_eq!(cutflow.stages[1].sum_weight_squared, 1.0 + 9.0 + 0.25);
}

#[test]
fn parallel_processing_matches_sequential() {
    let config = config();
    let hooks  = counting_hooks(Arc::new(AtomicUsize::new(0)));
    let processor = SampleProcessor::new(&config, &hooks, Span::none());

    let ids = vec!["p0".to_string(), "p1".to_string(), "p_empty".to_string()];
    let parallel = processor
        .process_sample_parallel("ttbar", &ids, |id| Ok(frame(id)))
        .unwrap()
        .unwrap();
    let sequential = processor
        .process_sample("ttbar", ids.iter().map(|id| (id.clone(), frame(id))))
        .unwrap()
        .unwrap();
    assert_eq!(parallel, sequential);
}

#[test]
fn job_outputs_merge_to_the_full_result() {
    let config = config();
    let hooks  = DefinitionHooks::new();
    let processor = SampleProcessor::new(&config, &hooks, Span::none());
    let files = ["p0", "p1"];

    let full_tree = processor
        .process_sample("ttbar", files.map(|id| (id.to_string(), frame(id))))
        .unwrap()
        .unwrap();
    let mut full = KeyedStore::new();
    write_tree(&full_tree, &mut full, WriteOptions::default(), &Span::none()).unwrap();
    assert!(full.histogram("NOSYS", "jet_pt_SR").is_some());
    assert!(full.cutflow("Cutflow_main").is_some());

    let mut outputs = Vec::new();
    let mut stores  = Vec::new();
    for index in 0..2 {
        let split = JobSplit::new(2, index).unwrap();
        let mine  = select_files(&files, Some(&split)).unwrap();
        let tree  = processor
            .process_sample("ttbar", mine.iter().map(|id| (id.clone(), frame(id))))
            .unwrap()
            .unwrap();
        let mut store = KeyedStore::new();
        write_tree(&tree, &mut store, WriteOptions::default(), &Span::none()).unwrap();
        outputs.push(output_name("ttbar", Some(&split), ".bin"));
        stores.push(store.encode(Codec::Lz4).unwrap());
    }

    let grouped = group_job_outputs(&outputs[..], &["ttbar".to_string()]).unwrap();
    assert_eq!(grouped["ttbar"].len(), 2);

    let mut merged = KeyedStore::decode(&stores[0]).unwrap();
    merge_store(&mut merged, &KeyedStore::decode(&stores[1]).unwrap()).unwrap();
    assert_eq!(merged, full);

    let mut corrupted = stores[1].clone();
    let mid = corrupted.len() / 2;
    corrupted[mid] ^= 0x5A;
    assert!(matches!(
        KeyedStore::decode(&corrupted),
        Err(SystError::ChecksumMismatch | SystError::Sink(_))
    ));
}

#[test]
fn ntuple_plan_and_truth_registration() {
    let config = config();
    let hooks  = DefinitionHooks::new();
    let processor = SampleProcessor::new(&config, &hooks, Span::none());
    let sample  = config.sample("ttbar").unwrap();
    let catalog = processor.prepare_catalog(sample, &frame("p0")).unwrap();

    let (plan, mut builder) = processor.ntuple_columns(sample, &catalog, "p0", frame("p0")).unwrap();
    assert_eq!(
        plan.selection.as_deref(),
        Some("(jet_pt_NOSYS > 1) || (jet_pt_JES_UP > 1)"),
    );
    assert!(plan.columns.contains(&"jet_pt_JES_UP".to_string()));
    assert!(plan.columns.contains(&"weight_total_NOSYS".to_string()));

    processor
        .define_truth(&mut builder, sample, "p0", "truth", &["truth_pt_NOSYS".to_string()])
        .unwrap();
    let by = builder.registry().affected_by("truth.truth_pt_NOSYS").unwrap();
    assert_eq!(by, &BTreeSet::from(["NOSYS".to_string()]));
}

#[test]
fn nominal_only_samples_drop_variation_columns_from_ntuples() {
    let mut config = config();
    config.samples[0] = config.samples[0].clone().nominal_only();
    let hooks = DefinitionHooks::new();
    let processor = SampleProcessor::new(&config, &hooks, Span::none());
    let sample  = config.sample("ttbar").unwrap();
    let catalog = processor.prepare_catalog(sample, &frame("p0")).unwrap();
    assert_eq!(catalog.names(), vec!["NOSYS".to_string()]);

    let (plan, _) = processor.ntuple_columns(sample, &catalog, "p0", frame("p0")).unwrap();
    assert!(!plan.columns.contains(&"jet_pt_JES_UP".to_string()));
    assert!(plan.columns.contains(&"jet_pt_NOSYS".to_string()));
    assert_eq!(plan.selection.as_deref(), Some("jet_pt_NOSYS > 1"));
}

#[test]
fn automatic_variations_respect_exclusions() {
    let mut config = config();
    config.samples[0] = config.samples[0].clone().automatic().excluding("JER.*");
    let hooks = DefinitionHooks::new();
    let processor = SampleProcessor::new(&config, &hooks, Span::none());
    let sample  = config.sample("ttbar").unwrap();
    let catalog = processor.prepare_catalog(sample, &frame("p0")).unwrap();
    assert!(catalog.contains("JES_UP"));
    assert!(!catalog.contains("JER_DOWN"));

    let missing = SampleConfig::new("ttbar").with_sum_weights("OTHER", 1.0);
    let config  = ProcessConfig::new(config.regions.clone(), vec![missing]);
    let processor = SampleProcessor::new(&config, &hooks, Span::none());
    let err = processor.process_sample("ttbar", [("p0".to_string(), frame("p0"))]).unwrap_err();
    assert!(matches!(err, SystError::MissingSumWeights(ref k) if k == "NOSYS"));
}
