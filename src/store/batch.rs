use super::SetOptions;

/// A buffered write command
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Set {
        key: String,
        value: Vec<u8>,
        options: SetOptions,
    },
    Del {
        keys: Vec<String>,
    },
    Rename {
        from: String,
        to: String,
    },
    HSet {
        key: String,
        fields: Vec<(String, Vec<u8>)>,
    },
    HDel {
        key: String,
        fields: Vec<String>,
    },
    RPush {
        key: String,
        values: Vec<Vec<u8>>,
    },
    ZAdd {
        key: String,
        member: String,
        score: f64,
        nx: bool,
    },
    ZRem {
        key: String,
        members: Vec<String>,
    },
    Publish {
        channel: String,
        message: Vec<u8>,
    },
}

/// Pipeline handle accepted by every write path.
///
/// Commands are queued in submission order and sent in one round trip by
/// `StoreClient::execute_batch`. An atomic batch runs inside MULTI/EXEC.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    atomic: bool,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn atomic() -> Self {
        Self {
            ops: Vec::new(),
            atomic: true,
        }
    }

    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }

    pub fn push(
        &mut self,
        op: BatchOp,
    ) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: Vec<u8>,
        options: SetOptions,
    ) -> &mut Self {
        self.push(BatchOp::Set {
            key: key.into(),
            value,
            options,
        })
    }

    pub fn del(
        &mut self,
        keys: Vec<String>,
    ) -> &mut Self {
        self.push(BatchOp::Del { keys })
    }

    pub fn rename(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> &mut Self {
        self.push(BatchOp::Rename {
            from: from.into(),
            to: to.into(),
        })
    }

    pub fn hset(
        &mut self,
        key: impl Into<String>,
        fields: Vec<(String, Vec<u8>)>,
    ) -> &mut Self {
        self.push(BatchOp::HSet {
            key: key.into(),
            fields,
        })
    }

    pub fn rpush(
        &mut self,
        key: impl Into<String>,
        values: Vec<Vec<u8>>,
    ) -> &mut Self {
        self.push(BatchOp::RPush {
            key: key.into(),
            values,
        })
    }

    pub fn zadd(
        &mut self,
        key: impl Into<String>,
        member: impl Into<String>,
        score: f64,
        nx: bool,
    ) -> &mut Self {
        self.push(BatchOp::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
            nx,
        })
    }

    pub fn zrem(
        &mut self,
        key: impl Into<String>,
        members: Vec<String>,
    ) -> &mut Self {
        self.push(BatchOp::ZRem {
            key: key.into(),
            members,
        })
    }

    pub fn publish(
        &mut self,
        channel: impl Into<String>,
        message: Vec<u8>,
    ) -> &mut Self {
        self.push(BatchOp::Publish {
            channel: channel.into(),
            message,
        })
    }
}
