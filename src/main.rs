use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use decoder_lm::{
    check_writable, create_fixed_length_sequences, get_model, load_config, read_corpus,
    read_token_file, save_snapshot_auto, test_model, train_model,
    dataset::read_lines,
    Device, LmError, ParameterSnapshot, Result, Tokenizer, TrainingConfig, Vocab,
};

// CLI 解析辅助函数
fn arg_has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn parse_str_arg(args: &[String], key: &str) -> Option<String> {
    let prefix = format!("{}=", key);
    args.iter()
        .find_map(|a| a.strip_prefix(&prefix).map(str::to_string))
}

/// 选项存在但无法解析时报配置错误，而不是静默使用默认值
fn parse_num_arg<T: FromStr>(args: &[String], key: &str) -> Result<Option<T>> {
    parse_str_arg(args, key)
        .map(|v| {
            v.parse::<T>()
                .map_err(|_| LmError::Config(format!("invalid value for {key}: {v}")))
        })
        .transpose()
}

fn parse_usize_arg(args: &[String], key: &str) -> Result<Option<usize>> {
    parse_num_arg(args, key)
}

fn parse_f32_arg(args: &[String], key: &str) -> Result<Option<f32>> {
    parse_num_arg(args, key)
}

fn print_usage() {
    println!("用法: decoder-lm [选项]");
    println!();
    println!("  --config=FILE        从 JSON 文件读取配置（命令行选项会覆盖其中的值）");
    println!("  --train=FILE         训练语料（默认 wiki2.train.txt）");
    println!("  --valid=FILE         验证语料（默认 wiki2.valid.txt）");
    println!("  --test=FILE          测试语料（默认 wiki2.test.txt）");
    println!("  --pretokenized       语料为空白分隔的 token ID，而不是原始文本");
    println!("  --epochs=N --d_model=N --n_layers=N --heads=N --dropout=F");
    println!("  --batchsize=N --lr=F --seqlen=N --printevery=N --d_ff=N --seed=N");
    println!("  --vocab_size=N --max_seq_len=N --eta_min=F --cycle_factor=F");
    println!("  --sgdr               启用余弦退火 + 热重启学习率");
    println!("  --savename=FILE      训练结束后保存参数快照（.json 为 JSON，否则为二进制）");
    println!("  --loadname=FILE      从参数快照初始化模型");
    println!("  --device=N           使用第 N 号加速器（当前后端仅支持 CPU）");
    println!("  --no-cuda            强制使用 CPU");
    println!("  --history=FILE       把每个 epoch 的困惑度写入 JSON 文件");
    println!("  --verbose            输出每个 batch 的调试日志");
}

/// 命令行选项覆盖配置文件
fn apply_overrides(config: &mut TrainingConfig, args: &[String]) -> Result<()> {
    if let Some(v) = parse_usize_arg(args, "--epochs")? {
        config.epochs = v;
    }
    if let Some(v) = parse_usize_arg(args, "--d_model")? {
        config.d_model = v;
    }
    if let Some(v) = parse_usize_arg(args, "--n_layers")? {
        config.n_layers = v;
    }
    if let Some(v) = parse_usize_arg(args, "--heads")? {
        config.heads = v;
    }
    if let Some(v) = parse_f32_arg(args, "--dropout")? {
        config.dropout = v;
    }
    if let Some(v) = parse_usize_arg(args, "--batchsize")? {
        config.batch_size = v;
    }
    if let Some(v) = parse_f32_arg(args, "--lr")? {
        config.learning_rate = v;
    }
    if let Some(v) = parse_usize_arg(args, "--seqlen")? {
        config.seqlen = v;
    }
    if let Some(v) = parse_usize_arg(args, "--printevery")? {
        config.printevery = v;
    }
    if let Some(v) = parse_usize_arg(args, "--d_ff")? {
        config.d_ff = v;
    }
    if let Some(v) = parse_usize_arg(args, "--seed")? {
        config.seed = v as u64;
    }
    if let Some(v) = parse_usize_arg(args, "--vocab_size")? {
        config.vocab_size = v;
    }
    if let Some(v) = parse_usize_arg(args, "--max_seq_len")? {
        config.max_seq_len = v;
    }
    if let Some(v) = parse_f32_arg(args, "--eta_min")? {
        config.eta_min = v;
    }
    if let Some(v) = parse_f32_arg(args, "--cycle_factor")? {
        config.cycle_factor = v;
    }
    if let Some(v) = parse_str_arg(args, "--savename") {
        config.savename = Some(PathBuf::from(v));
    }
    if let Some(v) = parse_str_arg(args, "--loadname") {
        config.loadname = Some(PathBuf::from(v));
    }
    if let Some(v) = parse_usize_arg(args, "--device")? {
        config.device = Device::Accelerator(v);
    }
    if arg_has_flag(args, "--no-cuda") {
        config.device = Device::Cpu;
    }
    if arg_has_flag(args, "--sgdr") {
        config.sgdr = true;
    }
    Ok(())
}

/// 读取三份语料，返回 (train, valid, test, vocab_size)
fn load_corpora(
    args: &[String],
    config: &TrainingConfig,
) -> Result<(Vec<usize>, Vec<usize>, Vec<usize>, usize)> {
    let train_path = parse_str_arg(args, "--train").unwrap_or_else(|| "wiki2.train.txt".into());
    let valid_path = parse_str_arg(args, "--valid").unwrap_or_else(|| "wiki2.valid.txt".into());
    let test_path = parse_str_arg(args, "--test").unwrap_or_else(|| "wiki2.test.txt".into());

    if arg_has_flag(args, "--pretokenized") {
        let train = read_token_file(&train_path)?;
        let valid = read_token_file(&valid_path)?;
        let test = read_token_file(&test_path)?;

        let max_id = train.iter().chain(&valid).chain(&test).copied().max().unwrap_or(0);
        if max_id >= config.vocab_size {
            return Err(LmError::Config(format!(
                "token id {} is outside vocab_size {}",
                max_id, config.vocab_size
            )));
        }
        return Ok((train, valid, test, config.vocab_size));
    }

    // 词表只由训练语料构建，同一份训练语料总是得到同样的编号
    let lines = read_lines(&train_path)?;
    let vocab = Vocab::build(lines.iter().map(String::as_str));
    log::info!("词表大小: {}", vocab.vocab_size());

    let train = read_corpus(&train_path, &vocab)?;
    let valid = read_corpus(&valid_path, &vocab)?;
    let test = read_corpus(&test_path, &vocab)?;
    Ok((train, valid, test, vocab.vocab_size()))
}

fn run(args: &[String]) -> Result<()> {
    let mut config = match parse_str_arg(args, "--config") {
        Some(path) => load_config(path)?,
        None => TrainingConfig::default(),
    };
    apply_overrides(&mut config, args)?;
    config.validate()?;
    log::info!("配置: {:?}", config);

    if let Some(path) = config.savename.as_ref() {
        check_writable(path)?;
    }

    let (train, valid, test, vocab_size) = load_corpora(args, &config)?;
    config.vocab_size = vocab_size;

    let train_windows = create_fixed_length_sequences(&train, config.seqlen);
    let valid_windows = create_fixed_length_sequences(&valid, config.seqlen);
    let test_windows = create_fixed_length_sequences(&test, config.seqlen);
    log::info!(
        "窗口数: 训练 {}, 验证 {}, 测试 {}（窗口长度 {}）",
        train_windows.nrows(),
        valid_windows.nrows(),
        test_windows.nrows(),
        config.seqlen
    );

    let mut model = get_model(&config, vocab_size)?;
    log::info!("total params: {}", model.total_parameters());

    let history = train_model(&mut model, &config, &train_windows, &valid_windows)?;

    if let Some(path) = parse_str_arg(args, "--history") {
        let json = serde_json::to_string_pretty(&history)
            .map_err(|e| LmError::Serialization(e.to_string()))?;
        std::fs::write(&path, json).map_err(|e| LmError::io(&path, e))?;
        log::info!("训练记录已写入 {}", path);
    }

    test_model(&mut model, &config, &test_windows)?;

    if let Some(path) = config.savename.as_ref() {
        save_snapshot_auto(&ParameterSnapshot::from_model(&model), path)?;
    }

    Ok(())
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if arg_has_flag(&args, "--help") || arg_has_flag(&args, "-h") {
        print_usage();
        return ExitCode::SUCCESS;
    }

    // 初始化日志系统
    let level = if arg_has_flag(&args, "--verbose") {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    if let Err(e) = simple_logger::SimpleLogger::new().with_level(level).init() {
        eprintln!("日志初始化失败: {}", e);
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = TrainingConfig::default();
        apply_overrides(
            &mut config,
            &args(&["--epochs=3", "--dropout=0.25", "--sgdr", "--device=1", "--no-cuda"]),
        )
        .unwrap();
        assert_eq!(config.epochs, 3);
        assert_eq!(config.dropout, 0.25);
        assert!(config.sgdr);
        assert_eq!(config.device, Device::Cpu);
    }

    #[test]
    fn test_malformed_values_are_config_errors() {
        for bad in ["--dropout=0.5x", "--epochs=ten", "--lr=", "--batchsize=-1"] {
            let mut config = TrainingConfig::default();
            match apply_overrides(&mut config, &args(&[bad])) {
                Err(LmError::Config(msg)) => assert!(msg.contains("invalid value"), "{}", msg),
                other => panic!("{} 应当报配置错误, got {:?}", bad, other),
            }
        }
    }

    #[test]
    fn test_unwritable_savename_fails_before_training() {
        let dir = tempfile::tempdir().unwrap();
        let missing_parent = dir.path().join("no_such_dir").join("model.bin");
        let result = run(&args(&[
            "--epochs=1",
            &format!("--savename={}", missing_parent.display()),
            "--train=/nonexistent/train.txt",
        ]));
        // 在读取语料之前就因保存路径报错
        match result {
            Err(LmError::Io { path, .. }) => assert_eq!(path, missing_parent),
            other => panic!("expected Io error on savename, got {:?}", other),
        }
    }
}
