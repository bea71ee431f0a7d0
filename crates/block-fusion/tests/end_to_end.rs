//! Integration test: fuse real Zarr source views described by a catalog
//! file, driven by a YAML job file.

use std::path::Path;

use block_fusion::{
    BlockSamples, ContainerWriter, FusionDriver, FusionJobConfig, LocalExecutor, MeanFusion,
    OutputDataType, ZarrViewCatalogLoader,
};
use test_utils::{output_container, ramp_volume, view_container, write_zarr_volume};

const VIEW_DIMS: [usize; 3] = [20, 16, 10];

/// Two ramp views, the second shifted by 10 voxels along x.
fn write_catalog(dir: &Path) -> std::path::PathBuf {
    for setup in 0..2 {
        write_zarr_volume(
            &view_container(dir, setup),
            VIEW_DIMS,
            [8, 8, 4],
            &ramp_volume(VIEW_DIMS),
        )
        .unwrap();
    }

    let catalog = dir.join("views.yaml");
    std::fs::write(
        &catalog,
        r#"
views:
  - timepoint: 0
    setup: 0
    path: view-setup0.zarr
  - timepoint: 0
    setup: 1
    path: view-setup1.zarr
    transform: [1, 0, 0, 10, 0, 1, 0, 0, 0, 0, 1, 0]
cache_size_mb: 8
"#,
    )
    .unwrap();
    catalog
}

fn write_job(dir: &Path, catalog: &Path, extra: &str) -> FusionJobConfig {
    let job = dir.join("job.yaml");
    std::fs::write(
        &job,
        format!(
            "container: {}\ncatalog: {}\nblock_size: [16, 16, 8]\nexecutor: {{ threads: 3 }}\n{}",
            output_container(dir).display(),
            catalog.display(),
            extra
        ),
    )
    .unwrap();
    FusionJobConfig::from_file(&job).unwrap()
}

/// Expected fused value at output voxel `(x, y, z)`.
fn expected(x: u64, y: u64, z: u64) -> f32 {
    let ramp = |x: u64| (x + y * 20 + z * 320) as f32;
    match x {
        0..=9 => ramp(x),
        10..=19 => (ramp(x) + ramp(x - 10)) / 2.0,
        _ => ramp(x - 10),
    }
}

#[test]
fn test_fuse_zarr_views() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = write_catalog(dir.path());
    let config = write_job(dir.path(), &catalog, "dataset: /fused/s0\n");

    let loader = ZarrViewCatalogLoader::from_file(&config.catalog).unwrap();
    let executor = LocalExecutor::from_config(&config.executor).unwrap();
    let summary = FusionDriver::new(&config, &loader, &MeanFusion, &executor)
        .run()
        .unwrap();

    assert_eq!(summary.bounding_box.min(), [0, 0, 0]);
    assert_eq!(summary.bounding_box.max(), [29, 15, 9]);
    // [30, 16, 10] with [16, 16, 8] -> 2 x 1 x 2
    assert_eq!(summary.blocks_written(), 4);

    let spec = &summary.datasets[0];
    let writer = ContainerWriter::open(spec).unwrap();
    let fused = match writer.read_region([0, 0, 0], spec.dimensions).unwrap() {
        BlockSamples::Float32(v) => v,
        other => panic!("unexpected samples {:?}", other.data_type()),
    };

    let [w, h, _] = spec.dimensions;
    for (z, y, x) in [(0, 0, 0), (0, 0, 9), (0, 0, 10), (3, 7, 15), (9, 15, 19), (9, 15, 29)] {
        let index = (x + y * w + z * w * h) as usize;
        assert_eq!(fused[index], expected(x, y, z), "voxel ({}, {}, {})", x, y, z);
    }
}

#[test]
fn test_bdv_target_on_shared_writer() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = write_catalog(dir.path());
    let config = write_job(
        dir.path(),
        &catalog,
        "bdv: { timepoint: 0, setup: 3 }\nbackend: zarr_sharded\ndata_type: uint16\nmin_intensity: 0\nmax_intensity: 65535\nviews: [{ timepoint: 0, setup: 0 }]\n",
    );

    let loader = ZarrViewCatalogLoader::from_file(&config.catalog).unwrap();
    let executor = LocalExecutor::from_config(&config.executor).unwrap();
    let summary = FusionDriver::new(&config, &loader, &MeanFusion, &executor)
        .run()
        .unwrap();

    let spec = &summary.datasets[0];
    assert_eq!(spec.dataset, "/setup3/timepoint0/s0");
    assert_eq!(spec.data_type, OutputDataType::Int16);
    assert_eq!(spec.dimensions, [20, 16, 10]);

    let writer = ContainerWriter::open(spec).unwrap();
    let row = writer.read_region([17, 15, 9], [3, 1, 1]).unwrap();
    let values: Vec<f64> = row.to_f64();
    assert_eq!(values, vec![3197.0, 3198.0, 3199.0]);
}
