use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 转换工具支持的输出版本。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutputVersion {
    Acad9,
    Acad10,
    Acad12,
    Acad13,
    Acad14,
    Acad2000,
    Acad2004,
    Acad2007,
    Acad2010,
    Acad2013,
    #[default]
    Acad2018,
}

impl OutputVersion {
    pub const ALL: [OutputVersion; 11] = [
        OutputVersion::Acad9,
        OutputVersion::Acad10,
        OutputVersion::Acad12,
        OutputVersion::Acad13,
        OutputVersion::Acad14,
        OutputVersion::Acad2000,
        OutputVersion::Acad2004,
        OutputVersion::Acad2007,
        OutputVersion::Acad2010,
        OutputVersion::Acad2013,
        OutputVersion::Acad2018,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OutputVersion::Acad9 => "ACAD9",
            OutputVersion::Acad10 => "ACAD10",
            OutputVersion::Acad12 => "ACAD12",
            OutputVersion::Acad13 => "ACAD13",
            OutputVersion::Acad14 => "ACAD14",
            OutputVersion::Acad2000 => "ACAD2000",
            OutputVersion::Acad2004 => "ACAD2004",
            OutputVersion::Acad2007 => "ACAD2007",
            OutputVersion::Acad2010 => "ACAD2010",
            OutputVersion::Acad2013 => "ACAD2013",
            OutputVersion::Acad2018 => "ACAD2018",
        }
    }
}

impl fmt::Display for OutputVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 不区分大小写解析，失败时返回原始输入。
impl FromStr for OutputVersion {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim();
        OutputVersion::ALL
            .into_iter()
            .find(|version| version.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| value.to_string())
    }
}

/// 工具命令行中的输出文件类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Dxf,
    Dwg,
}

impl OutputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputKind::Dxf => "DXF",
            OutputKind::Dwg => "DWG",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputKind::Dxf => "dxf",
            OutputKind::Dwg => "dwg",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_parse_case_insensitively() {
        assert_eq!("acad2013".parse(), Ok(OutputVersion::Acad2013));
        assert_eq!(" ACAD9 ".parse(), Ok(OutputVersion::Acad9));
        assert_eq!("ACAD2019".parse::<OutputVersion>(), Err("ACAD2019".to_string()));
    }

    #[test]
    fn serde_uses_tool_spelling() {
        let json = serde_json::to_string(&OutputVersion::Acad2018).expect("序列化失败");
        assert_eq!(json, "\"ACAD2018\"");
        for version in OutputVersion::ALL {
            let text = serde_json::to_string(&version).expect("序列化失败");
            assert_eq!(text.trim_matches('"'), version.as_str());
        }
    }
}
