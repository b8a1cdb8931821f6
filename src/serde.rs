use std::marker::PhantomData;

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize, Serializer};

use crate::SkipTreeMap;

impl<K, V> Serialize for SkipTreeMap<K, V>
where
    K: 'static + Serialize + Clone + Ord + Send + Sync,
    V: 'static + Serialize + Clone + Send + Sync,
{
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = s.serialize_map(Some(self.len()))?;
        for (k, v) in self.iter() {
            map.serialize_entry(&k, &v)?;
        }
        map.end()
    }
}

struct SkipTreeMapVisitor<K, V> {
    pd: PhantomData<(K, V)>,
}

impl<'de, K, V> Visitor<'de> for SkipTreeMapVisitor<K, V>
where
    K: 'static + Deserialize<'de> + Clone + Ord + Send + Sync,
    V: 'static + Deserialize<'de> + Clone + Send + Sync,
{
    type Value = SkipTreeMap<K, V>;

    fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("a map of entries in ascending key order")
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let map = SkipTreeMap::default();

        while let Some((key, value)) = access.next_entry()? {
            map.insert(key, value);
        }

        Ok(map)
    }
}

impl<'de, K, V> Deserialize<'de> for SkipTreeMap<K, V>
where
    K: 'static + Deserialize<'de> + Clone + Ord + Send + Sync,
    V: 'static + Deserialize<'de> + Clone + Send + Sync,
{
    fn deserialize<D>(d: D) -> Result<SkipTreeMap<K, V>, D::Error>
    where
        D: Deserializer<'de>,
    {
        d.deserialize_map(SkipTreeMapVisitor { pd: PhantomData })
    }
}
