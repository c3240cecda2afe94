// 端到端：切分 → 训练 → 保存 → 加载 → 测试

use decoder_lm::{
    create_fixed_length_sequences, get_model, load_snapshot_auto, save_snapshot_auto,
    test_model, train_model, CausalMask, ParameterSnapshot, TrainingConfig,
};
use tempfile::tempdir;

fn config() -> TrainingConfig {
    TrainingConfig {
        epochs: 2,
        d_model: 8,
        n_layers: 1,
        heads: 2,
        d_ff: 16,
        dropout: 0.0,
        batch_size: 4,
        learning_rate: 1e-3,
        seqlen: 5,
        max_seq_len: 16,
        vocab_size: 100,
        seed: 7,
        printevery: 2,
        ..TrainingConfig::default()
    }
}

fn corpus() -> Vec<usize> {
    (0..100).map(|i| (i * 37 + 11) % 100).collect()
}

#[test]
fn test_train_save_load_and_test() {
    let config = config();
    let windows = create_fixed_length_sequences(&corpus(), config.seqlen);
    assert_eq!(windows.dim(), (20, 5));

    let mut model = get_model(&config, config.vocab_size).unwrap();
    let history = train_model(&mut model, &config, &windows, &windows).unwrap();

    assert_eq!(history.train_perplexity.len(), 2);
    assert_eq!(history.valid_perplexity.len(), 2);
    for ppl in history.train_perplexity.iter().chain(&history.valid_perplexity) {
        assert!(ppl.is_finite() && *ppl > 1.0, "perplexity {}", ppl);
    }
    assert!(model.is_training());

    let dir = tempdir().unwrap();
    let path = dir.path().join("model.bin");
    save_snapshot_auto(&ParameterSnapshot::from_model(&model), &path).unwrap();

    // 用另一个种子构建后再加载，参数应完全覆盖
    let load_config = TrainingConfig {
        seed: 99,
        loadname: Some(path.clone()),
        ..config.clone()
    };
    let mut restored = get_model(&load_config, config.vocab_size).unwrap();

    model.set_training_mode(false);
    restored.set_training_mode(false);
    let tokens = [3usize, 50, 97, 3];
    let mask = CausalMask::new(tokens.len());
    assert_eq!(
        model.forward(&tokens, &mask).unwrap(),
        restored.forward(&tokens, &mask).unwrap()
    );

    let ppl_a = test_model(&mut model, &config, &windows).unwrap();
    let ppl_b = test_model(&mut restored, &config, &windows).unwrap();
    assert!((ppl_a - ppl_b).abs() < 1e-9);

    assert_eq!(
        load_snapshot_auto(&path).unwrap().parameter_count(),
        model.total_parameters()
    );
}

#[test]
fn test_training_lowers_perplexity_on_repeated_data() {
    // 同一个窗口反复出现，模型应当很快记住它
    let config = TrainingConfig {
        epochs: 5,
        learning_rate: 1e-2,
        ..config()
    };
    let tokens: Vec<usize> = [1usize, 2, 3, 4, 5].iter().copied().cycle().take(40).collect();
    let windows = create_fixed_length_sequences(&tokens, config.seqlen);

    let mut model = get_model(&config, config.vocab_size).unwrap();
    let history = train_model(&mut model, &config, &windows, &windows).unwrap();

    let first = history.valid_perplexity[0];
    let last = *history.valid_perplexity.last().unwrap();
    assert!(last < first, "{} -> {}", first, last);
}

#[test]
fn test_sgdr_records_learning_rates() {
    let config = TrainingConfig {
        sgdr: true,
        eta_min: 1e-5,
        ..config()
    };
    let windows = create_fixed_length_sequences(&corpus(), config.seqlen);

    let mut model = get_model(&config, config.vocab_size).unwrap();
    let history = train_model(&mut model, &config, &windows, &windows).unwrap();

    assert_eq!(history.learning_rates.len(), config.epochs);
    for lr in &history.learning_rates {
        assert!(*lr >= config.eta_min * 0.999 && *lr <= config.learning_rate * 1.001, "lr {}", lr);
    }
}

#[test]
fn test_too_few_windows_is_an_error() {
    let config = config();
    // 3 个窗口 < batch_size 4，drop_last 后没有任何 batch
    let windows = create_fixed_length_sequences(&corpus()[..15], config.seqlen);
    let mut model = get_model(&config, config.vocab_size).unwrap();
    assert!(train_model(&mut model, &config, &windows, &windows).is_err());
}
