use std::collections::HashMap;

/// 把一行文本切成 token ID 序列。训练核心只依赖这个接口，
/// 具体的分词器（词表、BPE 等）由调用方提供。
pub trait Tokenizer {
    fn encode(&self, line: &str) -> Vec<usize>;

    fn vocab_size(&self) -> usize;
}

pub const UNK_TOKEN: &str = "<unk>";
pub const UNK_ID: usize = 0;

/// 按空白切分的词级词表，`<unk>` 固定为 0 号。
///
/// 从训练语料构建后即冻结；验证/测试集中未出现过的词映射为 `<unk>`。
/// 词的编号按首次出现的顺序分配，同一份语料总是得到同一张词表。
#[derive(Clone, Debug)]
pub struct Vocab {
    pub index: HashMap<String, usize>,
    pub words: Vec<String>,
}

impl Default for Vocab {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Vocab {
    /// `words` 之前会自动插入 `<unk>`，重复的词只保留第一次
    pub fn new(words: Vec<&str>) -> Self {
        let mut vocab = Vocab {
            index: HashMap::new(),
            words: Vec::new(),
        };
        vocab.insert(UNK_TOKEN);
        for word in words {
            vocab.insert(word);
        }
        vocab
    }

    pub fn build<'a, I>(lines: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut vocab = Self::default();
        for line in lines {
            for word in line.split_whitespace() {
                vocab.insert(word);
            }
        }
        vocab
    }

    fn insert(&mut self, word: &str) {
        if !self.index.contains_key(word) {
            self.index.insert(word.to_string(), self.words.len());
            self.words.push(word.to_string());
        }
    }

    /// Convert a word to its token index
    pub fn token_id(&self, word: &str) -> Option<usize> {
        self.index.get(word).copied()
    }

    /// Convert a token index back to a word
    pub fn word(&self, token_id: usize) -> Option<&str> {
        self.words.get(token_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

impl Tokenizer for Vocab {
    fn encode(&self, line: &str) -> Vec<usize> {
        line.split_whitespace()
            .map(|word| self.token_id(word).unwrap_or(UNK_ID))
            .collect()
    }

    fn vocab_size(&self) -> usize {
        self.len()
    }
}
