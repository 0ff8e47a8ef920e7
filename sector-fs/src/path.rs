pub trait Path {
    fn is_absolute(&self) -> bool;

    /// 依次返回非空的路径项，连续的`/`视为一个
    fn components(&self) -> Components<'_>;

    /// 返回路径的`(父目录, 最后一项)`。
    ///
    /// 没有`/`时父目录为`""`，即工作目录；根目录与空串返回`None`。
    fn parent_file(&self) -> Option<(&str, &str)>;

    fn is_relative(&self) -> bool {
        !self.is_absolute()
    }
}

pub struct Components<'a> {
    inner: core::str::Split<'a, char>,
}

impl Path for str {
    #[inline]
    fn is_absolute(&self) -> bool {
        self.starts_with('/')
    }

    #[inline]
    fn components(&self) -> Components<'_> {
        Components {
            inner: self.split('/'),
        }
    }

    fn parent_file(&self) -> Option<(&str, &str)> {
        let trimmed = self.trim_end_matches('/');
        if trimmed.is_empty() {
            return None;
        }

        Some(match trimmed.rsplit_once('/') {
            // 形如`/a`，父目录是根目录
            Some((parent, file)) if parent.trim_end_matches('/').is_empty() => ("/", file),
            Some((parent, file)) => (parent, file),
            None => ("", trimmed),
        })
    }
}

impl<'a> Iterator for Components<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.by_ref().find(|cmp| !cmp.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_skip_empty() {
        let cmps: Vec<_> = "//a/./b//..//".components().collect();
        assert_eq!(vec!["a", ".", "b", ".."], cmps);
        assert_eq!(0, "/".components().count());
        assert!("/a".is_absolute());
        assert!("a/b".is_relative());
    }

    #[test]
    fn parent_file() {
        assert_eq!(Some(("/x", "y")), "/x/y".parent_file());
        assert_eq!(Some(("/", "x")), "/x".parent_file());
        assert_eq!(Some(("/", "x")), "//x/".parent_file());
        assert_eq!(Some(("a", "b")), "a/b".parent_file());
        assert_eq!(Some(("", "b")), "b".parent_file());
        assert_eq!(None, "/".parent_file());
        assert_eq!(None, "".parent_file());
    }
}
