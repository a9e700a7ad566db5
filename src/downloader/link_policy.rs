// 链接选择策略

use crate::catalog::{DownloadLink, LinkKind, MovieRecord};

/// 按类型优先级选择下一个未尝试的链接
#[derive(Debug, Clone)]
pub struct LinkPolicy {
    preference: Vec<LinkKind>,
}

impl LinkPolicy {
    pub fn new(preference: Vec<LinkKind>) -> Self {
        Self { preference }
    }

    /// 类型排名，未列出的类型排在最后
    fn rank(&self, kind: LinkKind) -> usize {
        self.preference
            .iter()
            .position(|k| *k == kind)
            .unwrap_or(self.preference.len())
    }

    /// 同一优先级内保持记录中的原有顺序
    pub fn choose<'a>(&self, record: &'a MovieRecord) -> Option<&'a DownloadLink> {
        record
            .untried_links()
            .enumerate()
            .min_by_key(|(index, link)| (self.rank(link.kind), *index))
            .map(|(_, link)| link)
    }
}

impl Default for LinkPolicy {
    fn default() -> Self {
        Self::new(vec![LinkKind::Magnet, LinkKind::Protocol, LinkKind::Ftp])
    }
}
